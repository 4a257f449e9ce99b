//! iwd AccessPoint proxy.

use zbus::proxy;

/// Proxy for the AP-mode interface.
///
/// Appears on the device object once its `Mode` property is switched to
/// "ap".
#[proxy(
    interface = "net.connman.iwd.AccessPoint",
    default_service = "net.connman.iwd",
    gen_blocking = false
)]
pub trait AccessPoint {
    /// Starts broadcasting a WPA2 access point.
    fn start(&self, ssid: &str, psk: &str) -> zbus::Result<()>;

    /// Stops the access point.
    fn stop(&self) -> zbus::Result<()>;
}
