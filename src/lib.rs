//! A desktop network daemon for Linux, exposed as a single D-Bus object.
//!
//! `xnetd` tracks the wireless supplicant (iwd), kernel link/address/route
//! events, and per-interface byte counters, and fuses them into one
//! observable state snapshot. Status bars and connection pickers talk to the
//! daemon through `org.xshell.Network`:
//!
//! - Wi-Fi power, scanning, association, and saved-profile management
//! - Hotspot (AP) mode and airplane mode
//! - USB tethering detection and DHCP control
//! - IP/gateway tracking and traffic counters
//! - Captive-portal probing
//!
//! # Architecture
//!
//! The [`state::StateManager`] is the hub: every producer (supplicant
//! client, kernel event watcher, traffic sampler) submits mutation closures
//! to it, and the bus facade translates each mutation into a
//! `PropertiesChanged` broadcast. Producers never talk to each other, only
//! to the store.
//!
//! The daemon does not speak 802.11 or run a DHCP client itself; iwd owns
//! association and profile persistence, and `dhcpcd` is invoked through a
//! privileged helper where addressing is needed.
//!
//! # Logging
//!
//! The library logs through the [`log`](https://docs.rs/log) facade. The
//! `xnetd` binary installs `env_logger`; set `RUST_LOG` or pass `--debug`.

mod netwatch;
mod proxies;
mod resume;
mod sysfs;
mod traffic;

// Public API modules
pub mod models;
pub mod service;
pub mod state;
pub mod supplicant;

pub use models::{ConnectionState, ConnectionType, Network, NetworkError, Security};
pub use state::{StateManager, StateSnapshot};
pub use supplicant::SupplicantClient;

pub use netwatch::NetWatcher;
pub use resume::watch_system_resume;
pub use traffic::TrafficSampler;

/// A specialized `Result` type for daemon operations.
pub type Result<T> = std::result::Result<T, NetworkError>;
