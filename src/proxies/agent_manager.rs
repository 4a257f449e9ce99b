//! iwd AgentManager proxy.

use zbus::proxy;
use zvariant::ObjectPath;

/// Proxy for registering the credential agent with iwd.
#[proxy(
    interface = "net.connman.iwd.AgentManager",
    default_service = "net.connman.iwd",
    default_path = "/net/connman/iwd",
    gen_blocking = false
)]
pub trait AgentManager {
    /// Registers an agent object exported by this connection.
    fn register_agent(&self, path: ObjectPath<'_>) -> zbus::Result<()>;

    /// Unregisters a previously registered agent.
    fn unregister_agent(&self, path: ObjectPath<'_>) -> zbus::Result<()>;
}
