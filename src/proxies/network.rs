//! iwd Network proxy.

use zbus::proxy;
use zvariant::OwnedObjectPath;

/// Proxy for a scanned network object.
#[proxy(
    interface = "net.connman.iwd.Network",
    default_service = "net.connman.iwd",
    gen_blocking = false
)]
pub trait Network {
    /// Associates with this network. Credentials are requested through the
    /// registered agent when needed.
    fn connect(&self) -> zbus::Result<()>;

    /// Network SSID.
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    /// Security type: "open", "psk" or "8021x".
    #[zbus(property, name = "Type")]
    fn network_type(&self) -> zbus::Result<String>;

    /// Whether this network is the connected one.
    #[zbus(property)]
    fn connected(&self) -> zbus::Result<bool>;

    /// Path to the KnownNetwork object; absent when the network is not
    /// saved, which surfaces as an error on read.
    #[zbus(property)]
    fn known_network(&self) -> zbus::Result<OwnedObjectPath>;
}
