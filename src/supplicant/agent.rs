//! The credential agent exported to iwd.
//!
//! iwd requests passphrases out-of-band from association: the daemon
//! registers an agent object and iwd calls back into it when a network
//! needs credentials. Passwords handed to [`connect`] are parked in a
//! [`PendingCredentials`] store keyed by network object path; the agent
//! consumes them on callback. Entries expire after 30 seconds so a stale
//! attempt can never leak a password into a later association.
//!
//! [`connect`]: super::SupplicantClient::connect

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use zvariant::ObjectPath;

/// Object path the agent is exported at.
pub const AGENT_PATH: &str = "/org/xshell/network/agent";

/// How long a parked password stays valid.
const CREDENTIAL_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct PendingCredential {
    password: String,
    created: Instant,
}

/// Passwords waiting for an agent callback, keyed by network path.
///
/// At most one entry exists per path; a new connect attempt for the same
/// network replaces the previous entry. Expiry is checked lazily on
/// lookup.
#[derive(Default)]
pub struct PendingCredentials {
    entries: Mutex<HashMap<String, PendingCredential>>,
}

impl PendingCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a password for the given network path.
    pub fn set(&self, network: &str, password: String) {
        debug!(
            "agent: pending credential for {network} ({} chars)",
            password.len()
        );
        self.insert_with_created(network, password, Instant::now());
    }

    fn insert_with_created(&self, network: &str, password: String, created: Instant) {
        self.entries
            .lock()
            .expect("credential lock poisoned")
            .insert(network.to_string(), PendingCredential { password, created });
    }

    /// Removes a parked password, e.g. after a failed association.
    pub fn clear(&self, network: &str) {
        self.entries
            .lock()
            .expect("credential lock poisoned")
            .remove(network);
    }

    /// Removes and returns the password for `network` if one is parked and
    /// still within its TTL. Expired entries are evicted.
    pub fn take_fresh(&self, network: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("credential lock poisoned");
        let cred = entries.remove(network)?;
        if cred.created.elapsed() > CREDENTIAL_TTL {
            warn!(
                "agent: credential for {network} expired (age {:?})",
                cred.created.elapsed()
            );
            return None;
        }
        Some(cred.password)
    }

    /// Drops every parked password.
    pub fn clear_all(&self) {
        self.entries
            .lock()
            .expect("credential lock poisoned")
            .clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Errors returned to iwd from agent callbacks.
///
/// iwd matches on the error name; anything under
/// `net.connman.iwd.Agent.Error` with the `Canceled` member tells it to
/// abort the credential request without retrying.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "net.connman.iwd.Agent.Error")]
pub enum AgentError {
    #[zbus(error)]
    ZBus(zbus::Error),
    Canceled(String),
}

/// The `net.connman.iwd.Agent` object.
///
/// Holds a non-owning lookup handle to the pending store; the store itself
/// is owned by the supplicant client, which wires both up at construction.
pub struct CredentialAgent {
    pending: Arc<PendingCredentials>,
}

impl CredentialAgent {
    pub fn new(pending: Arc<PendingCredentials>) -> Self {
        Self { pending }
    }
}

#[zbus::interface(name = "net.connman.iwd.Agent")]
impl CredentialAgent {
    /// Called by iwd when a PSK/SAE network needs a passphrase.
    async fn request_passphrase(&self, network: ObjectPath<'_>) -> Result<String, AgentError> {
        debug!("agent: RequestPassphrase for {}", network.as_str());
        match self.pending.take_fresh(network.as_str()) {
            Some(password) => Ok(password),
            None => {
                warn!("agent: no usable credential for {}", network.as_str());
                Err(AgentError::Canceled("no credential available".into()))
            }
        }
    }

    /// 802.1x private-key passphrases are not supported.
    async fn request_private_key_passphrase(
        &self,
        network: ObjectPath<'_>,
    ) -> Result<String, AgentError> {
        debug!(
            "agent: RequestPrivateKeyPassphrase unsupported for {}",
            network.as_str()
        );
        Err(AgentError::Canceled(
            "private key passphrase not supported".into(),
        ))
    }

    /// 802.1x username/password prompting is not supported.
    async fn request_user_name_and_password(
        &self,
        network: ObjectPath<'_>,
    ) -> Result<(String, String), AgentError> {
        debug!(
            "agent: RequestUserNameAndPassword unsupported for {}",
            network.as_str()
        );
        Err(AgentError::Canceled(
            "username/password authentication not supported".into(),
        ))
    }

    /// 802.1x user-password prompting is not supported.
    async fn request_user_password(
        &self,
        network: ObjectPath<'_>,
        _user: &str,
    ) -> Result<String, AgentError> {
        debug!(
            "agent: RequestUserPassword unsupported for {}",
            network.as_str()
        );
        Err(AgentError::Canceled(
            "user password authentication not supported".into(),
        ))
    }

    /// Called when iwd abandons a request. Reasons include "out-of-range",
    /// "user-canceled", "timed-out" and "shutdown".
    async fn cancel(&self, reason: &str) {
        debug!("agent: request cancelled: {reason}");
        self.pending.clear_all();
    }

    /// Called when iwd unregisters the agent.
    async fn release(&self) {
        debug!("agent: released by supplicant");
        self.pending.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_fresh_consumes_entry() {
        let store = PendingCredentials::new();
        store.set("/net/0", "secret".into());

        assert_eq!(store.take_fresh("/net/0"), Some("secret".into()));
        // consumed; a second request must not see it again
        assert_eq!(store.take_fresh("/net/0"), None);
    }

    #[test]
    fn take_fresh_rejects_expired() {
        let store = PendingCredentials::new();
        store.insert_with_created(
            "/net/0",
            "stale".into(),
            Instant::now() - Duration::from_secs(31),
        );

        assert_eq!(store.take_fresh("/net/0"), None);
        // expired entry is evicted, not left behind
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn take_fresh_within_ttl() {
        let store = PendingCredentials::new();
        store.insert_with_created(
            "/net/0",
            "young".into(),
            Instant::now() - Duration::from_secs(29),
        );

        assert_eq!(store.take_fresh("/net/0"), Some("young".into()));
    }

    #[test]
    fn set_replaces_existing_entry() {
        let store = PendingCredentials::new();
        store.set("/net/0", "first".into());
        store.set("/net/0", "second".into());

        assert_eq!(store.len(), 1);
        assert_eq!(store.take_fresh("/net/0"), Some("second".into()));
    }

    #[test]
    fn clear_removes_single_path() {
        let store = PendingCredentials::new();
        store.set("/net/0", "a".into());
        store.set("/net/1", "b".into());

        store.clear("/net/0");

        assert_eq!(store.take_fresh("/net/0"), None);
        assert_eq!(store.take_fresh("/net/1"), Some("b".into()));
    }

    #[test]
    fn clear_all_empties_store() {
        let store = PendingCredentials::new();
        store.set("/net/0", "a".into());
        store.set("/net/1", "b".into());

        store.clear_all();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn missing_path_yields_none() {
        let store = PendingCredentials::new();
        assert_eq!(store.take_fresh("/net/absent"), None);
    }
}
