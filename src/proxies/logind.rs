//! logind Manager proxy.

use zbus::proxy;

/// Proxy for the slice of logind the daemon consumes: sleep/resume
/// notifications.
#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1",
    gen_blocking = false
)]
pub trait LogindManager {
    /// Emitted with `true` before suspend and `false` after resume.
    #[zbus(signal)]
    fn prepare_for_sleep(&self, start: bool);
}
