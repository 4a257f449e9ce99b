//! The shared state store.
//!
//! One [`StateSnapshot`] is owned by the [`StateManager`]; every other
//! component holds an `Arc` to the manager and goes through [`get`] for a
//! copy or [`update`] for a serialized mutation. The registered change
//! callback fires once per update, unconditionally, with a copy taken
//! under the write lock — diffing and deduplication are the consumer's
//! business.
//!
//! [`get`]: StateManager::get
//! [`update`]: StateManager::update

use std::sync::RwLock;
use std::time::Instant;

use crate::models::{ConnectionState, ConnectionType, Network};

/// Everything the daemon knows about the host's network state.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    // Wi-Fi state
    pub wifi_enabled: bool,
    pub wifi_scanning: bool,
    pub connection_state: ConnectionState,

    // Active connection
    pub active_ssid: String,
    /// Set while a connection attempt is in flight, cleared on completion.
    pub connecting_ssid: String,
    /// Generation counter of the attempt that owns `connecting_ssid`.
    pub connecting_generation: u64,
    pub active_security: String,
    pub signal_rssi: i16,
    pub signal_strength: u8,
    pub frequency: u32,

    // Addressing
    pub interface_name: String,
    pub mac_address: String,
    pub ip_address: String,
    pub gateway: String,
    pub connection_type: ConnectionType,

    // Traffic, bytes per sample interval
    pub traffic_in: u64,
    pub traffic_out: u64,

    // Collections
    pub networks: Vec<Network>,
    pub saved_networks: Vec<String>,

    // Features
    pub airplane_mode: bool,
    pub captive_portal_detected: bool,
    pub captive_portal_url: String,
    /// Last SSID probed for a captive portal; reset on disconnect.
    pub last_captive_check_ssid: String,
    pub hotspot_active: bool,
    pub hotspot_ssid: String,

    // USB tethering
    /// The USB interface exists.
    pub usb_interface_detected: bool,
    /// Carrier is up; the phone side is ready.
    pub usb_tethering_available: bool,
    /// IP assigned and default route present; actually usable.
    pub usb_tethering_connected: bool,
    pub usb_interface_name: String,
    /// ifindex; stable across renames, 0 when no interface is tracked.
    pub usb_interface_index: u32,

    // Diagnostics
    pub last_error: String,

    // Resume/startup markers, internal only (not exported on the bus)
    pub was_resumed: bool,
    pub resume_timestamp: Option<Instant>,
    pub weather_triggered: bool,
    pub is_startup: bool,
}

type ChangeCallback = Box<dyn Fn(&StateSnapshot) + Send + Sync>;

/// Serializes all snapshot mutations and fans out change notifications.
pub struct StateManager {
    state: RwLock<StateSnapshot>,
    on_change: RwLock<Option<ChangeCallback>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StateSnapshot::default()),
            on_change: RwLock::new(None),
        }
    }

    /// Registers the callback invoked after every update.
    ///
    /// The callback runs on the writer's thread and receives a copy of the
    /// snapshot taken under the write lock.
    pub fn set_on_change<F>(&self, callback: F)
    where
        F: Fn(&StateSnapshot) + Send + Sync + 'static,
    {
        *self.on_change.write().expect("state lock poisoned") = Some(Box::new(callback));
    }

    /// Returns a copy of the current state.
    pub fn get(&self) -> StateSnapshot {
        self.state.read().expect("state lock poisoned").clone()
    }

    /// Applies a mutation and notifies the change callback.
    ///
    /// The mutator must be non-blocking and must not call back into the
    /// store. The callback fires unconditionally, even when the mutator
    /// made no visible change.
    pub fn update<F>(&self, mutator: F)
    where
        F: FnOnce(&mut StateSnapshot),
    {
        let snapshot = {
            let mut st = self.state.write().expect("state lock poisoned");
            mutator(&mut st);
            st.clone()
        };

        let cb = self.on_change.read().expect("state lock poisoned");
        if let Some(cb) = cb.as_ref() {
            cb(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn get_returns_copy() {
        let mgr = StateManager::new();
        mgr.update(|st| st.active_ssid = "Home".into());

        let mut copy = mgr.get();
        copy.active_ssid = "Tampered".into();

        assert_eq!(mgr.get().active_ssid, "Home");
    }

    #[test]
    fn initial_state_is_disconnected() {
        let mgr = StateManager::new();
        let st = mgr.get();
        assert_eq!(st.connection_state, ConnectionState::Disconnected);
        assert!(!st.wifi_enabled);
        assert!(st.active_ssid.is_empty());
    }

    #[test]
    fn callback_fires_once_per_update() {
        let mgr = StateManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        mgr.set_on_change(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        mgr.update(|st| st.wifi_enabled = true);
        mgr.update(|_| {}); // no-op mutators still notify
        mgr.update(|st| st.wifi_enabled = false);

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn callback_sees_own_mutation() {
        let mgr = StateManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        mgr.set_on_change(move |st| {
            seen2.lock().unwrap().push(st.traffic_in);
        });

        mgr.update(|st| st.traffic_in = 1);
        mgr.update(|st| st.traffic_in = 2);
        mgr.update(|st| st.traffic_in = 3);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn updates_from_threads_are_serialized() {
        let mgr = Arc::new(StateManager::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    mgr.update(|st| st.traffic_in += 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mgr.get().traffic_in, 800);
    }
}
