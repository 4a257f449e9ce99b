//! iwd Device proxy.

use zbus::proxy;

/// Proxy for the per-adapter device interface.
///
/// Shares its object path with the Station (or AccessPoint) interface of
/// the same radio.
#[proxy(
    interface = "net.connman.iwd.Device",
    default_service = "net.connman.iwd",
    gen_blocking = false
)]
pub trait Device {
    /// Interface name, e.g. "wlan0".
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    /// MAC address.
    #[zbus(property)]
    fn address(&self) -> zbus::Result<String>;

    /// Radio power state.
    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_powered(&self, value: bool) -> zbus::Result<()>;

    /// "station", "ap" or "ad-hoc".
    #[zbus(property)]
    fn mode(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn set_mode(&self, value: &str) -> zbus::Result<()>;
}
