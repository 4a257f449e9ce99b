//! iwd KnownNetwork proxy.

use zbus::proxy;

/// Proxy for a saved network profile.
#[proxy(
    interface = "net.connman.iwd.KnownNetwork",
    default_service = "net.connman.iwd",
    gen_blocking = false
)]
pub trait KnownNetwork {
    /// Removes the profile from the supplicant's store.
    fn forget(&self) -> zbus::Result<()>;

    /// Network SSID.
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    /// Whether the supplicant reconnects unattended when in range.
    #[zbus(property)]
    fn auto_connect(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_auto_connect(&self, value: bool) -> zbus::Result<()>;
}
