//! D-Bus proxy traits for the remote services the daemon consumes.
//!
//! These traits define the slice of each remote API surface the daemon
//! actually uses; the `zbus::proxy` macro generates the proxy
//! implementations.
//!
//! # iwd D-Bus structure
//!
//! iwd owns the well-known name `net.connman.iwd` and exposes an object
//! manager at `/`:
//!
//! - `/net/connman/iwd` - AgentManager
//! - `/net/connman/iwd/{phy}/{dev}` - Device (+ Station or AccessPoint,
//!   depending on mode)
//! - `/net/connman/iwd/{phy}/{dev}/{id}` - Network objects
//! - `/net/connman/iwd/{id}` - KnownNetwork objects
//!
//! Object discovery goes through `zbus::fdo::ObjectManagerProxy` and
//! service lifecycle through `zbus::fdo::DBusProxy`; those need no custom
//! traits. logind's manager object is consumed for resume notifications.

mod access_point;
mod agent_manager;
mod device;
mod known_network;
mod logind;
mod network;
mod station;

pub use access_point::AccessPointProxy;
pub use agent_manager::AgentManagerProxy;
pub use device::DeviceProxy;
pub use known_network::KnownNetworkProxy;
pub use logind::LogindManagerProxy;
pub use network::NetworkProxy;
pub use station::StationProxy;

/// iwd's well-known bus name.
pub const IWD_SERVICE: &str = "net.connman.iwd";

/// Interface names, as they appear in `GetManagedObjects` results.
pub mod iface {
    pub const STATION: &str = "net.connman.iwd.Station";
    pub const DEVICE: &str = "net.connman.iwd.Device";
    pub const NETWORK: &str = "net.connman.iwd.Network";
    pub const KNOWN_NETWORK: &str = "net.connman.iwd.KnownNetwork";
}
