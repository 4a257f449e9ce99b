//! iwd Station proxy.

use zbus::proxy;
use zvariant::OwnedObjectPath;

/// Proxy for the per-radio station interface.
///
/// The station performs scanning and association. There is no fixed path;
/// the daemon discovers it through the object manager and builds the proxy
/// at the discovered path.
#[proxy(
    interface = "net.connman.iwd.Station",
    default_service = "net.connman.iwd",
    gen_blocking = false
)]
pub trait Station {
    /// Requests a scan. Returns `net.connman.iwd.Busy` while one is
    /// already running.
    fn scan(&self) -> zbus::Result<()>;

    /// Disassociates from the current network.
    fn disconnect(&self) -> zbus::Result<()>;

    /// Associates with a hidden network by SSID.
    fn connect_hidden_network(&self, ssid: &str) -> zbus::Result<()>;

    /// Returns `(network path, signal)` pairs ranked by signal strength.
    /// Signal is in 1/100 dBm units.
    fn get_ordered_networks(&self) -> zbus::Result<Vec<(OwnedObjectPath, i16)>>;

    /// "connected", "connecting", "disconnecting", "disconnected" or
    /// "roaming".
    #[zbus(property)]
    fn state(&self) -> zbus::Result<String>;

    /// Whether a scan is in progress.
    #[zbus(property)]
    fn scanning(&self) -> zbus::Result<bool>;

    /// Path of the currently connected network, absent when disconnected.
    #[zbus(property)]
    fn connected_network(&self) -> zbus::Result<OwnedObjectPath>;
}
