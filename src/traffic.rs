//! Per-interface traffic sampling.
//!
//! A one-second ticker reads the byte counters of whichever interface
//! currently carries traffic and writes per-interval deltas into the
//! store. Small deltas are suppressed to damp idle churn, but one `(0, 0)`
//! update goes out on the transition to idle so the UI eventually shows
//! zero.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::models::ConnectionState;
use crate::state::StateManager;
use crate::sysfs;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Deltas at or below this many bytes do not reach the store.
const MIN_DELTA_BYTES: u64 = 100;

/// Delta/idle bookkeeping between ticks.
///
/// Kept separate from the async loop so the suppression rules are plain
/// synchronous code.
#[derive(Debug, Default)]
struct SamplerState {
    last_rx: u64,
    last_tx: u64,
    idle_emitted: bool,
}

impl SamplerState {
    /// Feeds one counter reading and returns the `(in, out)` update to
    /// publish, if any.
    ///
    /// The first reading only establishes the baseline. Afterwards a delta
    /// above the threshold is published as-is; the first sub-threshold
    /// all-zero delta publishes `(0, 0)` once, then nothing until traffic
    /// resumes.
    fn advance(&mut self, rx: u64, tx: u64) -> Option<(u64, u64)> {
        if rx == 0 && tx == 0 {
            return None;
        }

        let (delta_rx, delta_tx) = if self.last_rx > 0 {
            (rx.saturating_sub(self.last_rx), tx.saturating_sub(self.last_tx))
        } else {
            (0, 0)
        };
        self.last_rx = rx;
        self.last_tx = tx;

        if delta_rx > MIN_DELTA_BYTES || delta_tx > MIN_DELTA_BYTES {
            self.idle_emitted = false;
            Some((delta_rx, delta_tx))
        } else if delta_rx == 0 && delta_tx == 0 && !self.idle_emitted {
            self.idle_emitted = true;
            Some((0, 0))
        } else {
            None
        }
    }
}

/// The sampling loop.
pub struct TrafficSampler {
    state: Arc<StateManager>,
    sys_root: PathBuf,
    sampler: SamplerState,
}

impl TrafficSampler {
    pub fn new(state: Arc<StateManager>) -> Self {
        Self {
            state,
            sys_root: PathBuf::from(sysfs::SYS_CLASS_NET),
            sampler: SamplerState::default(),
        }
    }

    /// Runs forever; spawn as a task.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.sample();
        }
    }

    fn sample(&mut self) {
        let st = self.state.get();

        // Selection order: connected Wi-Fi first, then the USB tether,
        // then whatever interface is up.
        let mut iface = st.interface_name.clone();
        if (iface.is_empty() || st.connection_state != ConnectionState::Connected)
            && st.usb_tethering_connected
            && !st.usb_interface_name.is_empty()
        {
            iface = st.usb_interface_name.clone();
        }
        if iface.is_empty() {
            match sysfs::find_active_interface(&self.sys_root) {
                Some(found) => iface = found,
                None => return,
            }
        }

        let (rx, tx) = sysfs::read_stats(&self.sys_root, &iface);
        if let Some((traffic_in, traffic_out)) = self.sampler.advance(rx, tx) {
            debug!("traffic on {iface}: in={traffic_in} out={traffic_out}");
            self.state.update(|s| {
                s.traffic_in = traffic_in;
                s.traffic_out = traffic_out;
                if traffic_in > 0 || traffic_out > 0 {
                    s.interface_name = iface.clone();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_only_establishes_baseline() {
        let mut s = SamplerState::default();
        assert_eq!(s.advance(10_000, 5_000), Some((0, 0)));
        // the (0,0) idle emission fires because the first delta is zero;
        // the counters themselves are recorded
        assert_eq!(s.last_rx, 10_000);
        assert_eq!(s.last_tx, 5_000);
    }

    #[test]
    fn zero_counters_are_ignored() {
        let mut s = SamplerState::default();
        assert_eq!(s.advance(0, 0), None);
        assert_eq!(s.last_rx, 0);
    }

    #[test]
    fn significant_delta_published() {
        let mut s = SamplerState::default();
        s.advance(10_000, 5_000);
        assert_eq!(s.advance(12_000, 5_050), Some((2_000, 50)));
    }

    #[test]
    fn small_delta_suppressed() {
        let mut s = SamplerState::default();
        s.advance(10_000, 5_000);
        s.advance(12_000, 5_000); // significant, resets idle marker
        assert_eq!(s.advance(12_050, 5_020), None);
    }

    #[test]
    fn idle_emits_zero_exactly_once() {
        let mut s = SamplerState::default();
        s.advance(10_000, 5_000);
        assert_eq!(s.advance(12_000, 5_500), Some((2_000, 500)));
        // transition to idle: one (0,0)
        assert_eq!(s.advance(12_000, 5_500), Some((0, 0)));
        // still idle: silence
        assert_eq!(s.advance(12_000, 5_500), None);
        assert_eq!(s.advance(12_000, 5_500), None);
    }

    #[test]
    fn activity_resumes_after_idle() {
        let mut s = SamplerState::default();
        s.advance(10_000, 5_000);
        s.advance(12_000, 5_500);
        s.advance(12_000, 5_500); // idle emission
        assert_eq!(s.advance(14_000, 5_500), Some((2_000, 0)));
        // and a fresh idle transition may emit zero again
        assert_eq!(s.advance(14_000, 5_500), Some((0, 0)));
    }

    #[test]
    fn threshold_is_strictly_greater() {
        let mut s = SamplerState::default();
        s.advance(10_000, 5_000);
        s.advance(12_000, 5_500); // reset idle marker
        assert_eq!(s.advance(12_100, 5_500), None); // exactly 100: suppressed
        assert_eq!(s.advance(12_201, 5_500), Some((101, 0)));
    }
}
