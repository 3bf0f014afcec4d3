use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use russh::keys::PublicKey;
use tokio_util::sync::CancellationToken;

/// Authorization data attached to a connection by the authentication
/// callbacks: critical options restrict what the principal may do,
/// extensions grant additional capabilities. The maps are shared between
/// the handshake callbacks and every session on the connection, so a value
/// written during auth is visible to handlers.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    critical_options: HashMap<String, String>,
    extensions: HashMap<String, String>,
}

impl Permissions {
    pub fn critical_option(&self, name: &str) -> Option<&str> {
        self.critical_options.get(name).map(String::as_str)
    }

    pub fn extension(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).map(String::as_str)
    }

    pub fn set_critical_option(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.critical_options.insert(name.into(), value.into());
    }

    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extensions.insert(name.into(), value.into());
    }

    pub fn critical_options(&self) -> &HashMap<String, String> {
        &self.critical_options
    }

    pub fn extensions(&self) -> &HashMap<String, String> {
        &self.extensions
    }
}

struct ContextInner {
    cancel: CancellationToken,
    conn_id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    server_version: String,
    client_version: Mutex<Option<String>>,
    user: Mutex<Option<String>>,
    public_key: Mutex<Option<PublicKey>>,
    permissions: Mutex<Permissions>,
    agent_requested: AtomicBool,
    // Typed extension values; writes are serialized by the lock, reads clone
    // the Arc out.
    values: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

/// Per-connection context handed to every callback and reachable from every
/// [`Session`](crate::Session) on the connection.
///
/// The context carries the connection's cancellation token (cancelled when
/// the connection ends, times out, or the server closes), connection
/// metadata filled in during the handshake, the shared [`Permissions`], and
/// a typed key/value store for application data. Cloning is cheap and all
/// clones observe the same state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(
        conn_id: u64,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        server_version: String,
    ) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                cancel: CancellationToken::new(),
                conn_id,
                remote_addr,
                local_addr,
                server_version,
                client_version: Mutex::new(None),
                user: Mutex::new(None),
                public_key: Mutex::new(None),
                permissions: Mutex::new(Permissions::default()),
                agent_requested: AtomicBool::new(false),
                values: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Token cancelled when the connection ends. Forward listeners and other
    /// per-connection resources tie their lifetime to it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Resolves when the connection context has been cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancels the connection: the stream is torn down and every task tied
    /// to this context unwinds.
    pub fn cancel(&self) {
        self.inner.cancel.cancel()
    }

    /// Framework-assigned identifier, unique per connection for the lifetime
    /// of the server. The transport does not expose the wire session hash,
    /// so this is what identifies the connection in logs and registries.
    pub fn session_id(&self) -> u64 {
        self.inner.conn_id
    }

    /// Username of the authenticated (or authenticating) principal; empty
    /// until the first auth attempt names one.
    pub fn user(&self) -> String {
        self.inner.user.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Identification string this server sent before the handshake.
    pub fn server_version(&self) -> String {
        self.inner.server_version.clone()
    }

    /// Identification string the client sent, as observed on the wire;
    /// empty until the first line of the connection has been read.
    pub fn client_version(&self) -> String {
        self.inner
            .client_version
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default()
    }

    /// Public key that authenticated the connection, if public-key auth
    /// succeeded.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.inner.public_key.lock().unwrap().clone()
    }

    /// Snapshot of the connection's permissions.
    pub fn permissions(&self) -> Permissions {
        self.inner.permissions.lock().unwrap().clone()
    }

    /// Mutates the shared permissions in place. Typically called from an
    /// auth callback to grant extensions that session handlers check later.
    pub fn update_permissions(&self, f: impl FnOnce(&mut Permissions)) {
        f(&mut self.inner.permissions.lock().unwrap())
    }

    /// True once the client has sent `auth-agent-req@openssh.com`.
    pub fn agent_requested(&self) -> bool {
        self.inner.agent_requested.load(Ordering::Relaxed)
    }

    /// Stores a typed value on the connection. One value per type; setting
    /// again replaces. Keys are type identities, not strings, so callers
    /// cannot collide by accident.
    pub fn set_value<T: Any + Send + Sync>(&self, value: T) {
        self.inner
            .values
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Reads a typed value previously stored with [`Context::set_value`].
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .values
            .lock()
            .unwrap()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub(crate) fn set_user(&self, user: &str) {
        let mut slot = self.inner.user.lock().unwrap();
        if slot.is_none() || slot.as_deref() != Some(user) {
            *slot = Some(user.to_string());
        }
    }

    pub(crate) fn set_public_key(&self, key: PublicKey) {
        *self.inner.public_key.lock().unwrap() = Some(key);
    }

    pub(crate) fn set_client_version(&self, version: String) {
        let mut slot = self.inner.client_version.lock().unwrap();
        if slot.is_none() {
            *slot = Some(version);
        }
    }

    pub(crate) fn set_agent_requested(&self) {
        self.inner.agent_requested.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("session_id", &self.session_id())
            .field("user", &self.user())
            .field("remote_addr", &self.remote_addr())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> Context {
        Context::new(
            7,
            "127.0.0.1:40022".parse().unwrap(),
            "127.0.0.1:22".parse().unwrap(),
            "SSH-2.0-test".to_string(),
        )
    }

    #[test]
    fn absent_values_do_not_panic() {
        let ctx = test_context();
        assert_eq!(ctx.user(), "");
        assert_eq!(ctx.client_version(), "");
        assert!(ctx.public_key().is_none());
        assert!(ctx.value::<String>().is_none());
    }

    #[test]
    fn typed_values_round_trip() {
        #[derive(PartialEq, Debug)]
        struct Marker(u32);

        let ctx = test_context();
        ctx.set_value(Marker(42));
        ctx.set_value("hello".to_string());
        assert_eq!(*ctx.value::<Marker>().unwrap(), Marker(42));
        assert_eq!(*ctx.value::<String>().unwrap(), "hello");
        // Same type replaces, distinct types never collide.
        ctx.set_value(Marker(43));
        assert_eq!(ctx.value::<Marker>().unwrap().0, 43);
    }

    #[test]
    fn permissions_are_shared_across_clones() {
        let ctx = test_context();
        let clone = ctx.clone();
        ctx.update_permissions(|p| p.set_extension("permit-port-forwarding", ""));
        assert!(clone
            .permissions()
            .extension("permit-port-forwarding")
            .is_some());
    }

    #[test]
    fn client_version_is_set_once() {
        let ctx = test_context();
        ctx.set_client_version("SSH-2.0-OpenSSH_9.7".into());
        ctx.set_client_version("SSH-2.0-other".into());
        assert_eq!(ctx.client_version(), "SSH-2.0-OpenSSH_9.7");
    }
}
