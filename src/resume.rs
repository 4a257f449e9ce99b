//! System resume watcher.
//!
//! Listens for logind's `PrepareForSleep` on the system bus. On resume it
//! marks the snapshot so the next IPv4 assignment can trigger one-shot
//! fetches, and kicks a scan — the supplicant's own autoconnect can be
//! slow to notice the radio is back, and a scan forces the issue.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use log::{debug, info, warn};
use zbus::Connection;

use crate::proxies::LogindManagerProxy;
use crate::state::StateManager;
use crate::supplicant::SupplicantClient;
use crate::Result;

/// Runs forever; spawn as a task. Failure to subscribe only loses resume
/// acceleration, never the daemon.
pub async fn watch_system_resume(
    state: Arc<StateManager>,
    supplicant: Option<Arc<SupplicantClient>>,
) {
    if let Err(e) = run(state, supplicant).await {
        warn!("system resume watcher unavailable: {e}");
    }
}

async fn run(
    state: Arc<StateManager>,
    supplicant: Option<Arc<SupplicantClient>>,
) -> Result<()> {
    let conn = Connection::system().await?;
    let logind = LogindManagerProxy::new(&conn).await?;
    let mut sleep_signals = logind.receive_prepare_for_sleep().await?;

    while let Some(signal) = sleep_signals.next().await {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                debug!("malformed PrepareForSleep: {e}");
                continue;
            }
        };

        if args.start {
            info!("system going to sleep");
            continue;
        }

        info!("system resumed from sleep");
        state.update(|st| {
            st.was_resumed = true;
            st.resume_timestamp = Some(Instant::now());
            st.weather_triggered = false;
        });

        if let Some(client) = &supplicant {
            info!("triggering scan to accelerate reconnection");
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = client.scan().await {
                    debug!("post-resume scan failed: {e}");
                }
            });
        }
    }

    Ok(())
}
