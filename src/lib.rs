//! Callback-driven SSH server framework on top of the `russh` transport.
//!
//! The transport library covers the wire protocol: key exchange, ciphers,
//! packets, request parsing. This crate layers the server you actually
//! write on top of it: an accept loop with graceful shutdown, a
//! per-connection [`Context`], a per-channel [`Session`] handed to your
//! handler, TCP and Unix-socket forwarding in both directions, agent
//! forwarding, and PTY handling (emulated or kernel-backed).
//!
//! ```no_run
//! use ssh_pier::{options, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::new(|session| async move {
//!         let _ = session.write(b"hello from ssh-pier\n").await;
//!     });
//!     server.set_option(options::password_auth(|_ctx, password| password == "hunter2"))?;
//!     server.set_option(options::addr("0.0.0.0:2222"))?;
//!     server.listen_and_serve().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet, SshId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

#[cfg(unix)]
pub mod agent;
pub mod auth;
mod conn;
mod context;
mod error;
pub mod options;
pub mod pty;
mod session;
#[cfg(unix)]
mod streamlocal;
mod tcpip;
pub mod utils;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use auth::{
    keys_equal, AuthorizedKeys, InteractiveDecision, KeyboardInteractiveHandler, PasswordHandler,
    PasswordHandlerExplicit, PublicKeyHandler,
};
pub use context::{Context, Permissions};
pub use error::{Error, Result};
pub use pty::{Pty, PtyMode, TerminalModes, Window};
pub use session::{Session, SessionReader, Signal};
#[cfg(unix)]
pub use streamlocal::{
    simple_unix_reverse_callback, LocalUnixForwardingCallback, ReverseUnixForwardingCallback,
};
pub use tcpip::{LocalPortForwardingCallback, ReversePortForwardingCallback};

use conn::ConnHandler;
use utils::{Activity, DeadlineStream};

/// A raw connection byte stream, as seen by [`ConnCallback`].
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

/// A raw connection byte stream, as seen by [`ConnCallback`].
pub type BoxedStream = Box<dyn AsyncReadWrite>;

/// The session handler: invoked once per accepted `shell`/`exec` request.
pub type SessionHandler =
    Arc<dyn Fn(Session) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Gate for `pty-req`: `(context, requested pty)`. Allows all when unset.
pub type PtyCallback = Arc<dyn Fn(&Context, &Pty) -> bool + Send + Sync>;

/// Gate consulted with the channel type (`session`, `direct-tcpip`, ...)
/// before type-specific handling. Allows all when unset.
pub type ChannelOpenCallback = Arc<dyn Fn(&Context, &str) -> bool + Send + Sync>;

/// Veto for `shell`/`exec`/`subsystem` requests; returning `false` refuses
/// the request before any handler runs.
pub type SessionRequestCallback = Arc<dyn Fn(&Session, &str) -> bool + Send + Sync>;

/// Wraps (or drops, by returning `None`) the raw byte stream before the
/// handshake.
pub type ConnCallback = Arc<dyn Fn(BoxedStream) -> Option<BoxedStream> + Send + Sync>;

/// Adapts an async closure into a [`SessionHandler`].
pub fn handler_fn<F, Fut>(f: F) -> SessionHandler
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |session| Box::pin(f(session)))
}

/// Full server configuration; mutated by options until `serve` snapshots
/// it for the connection handlers.
pub struct ServerConfig {
    pub(crate) addr: String,
    pub(crate) version: Option<String>,
    pub(crate) banner: Option<String>,
    pub(crate) host_keys: Vec<PrivateKey>,
    pub(crate) handler: SessionHandler,
    pub(crate) subsystem_handlers: HashMap<String, SessionHandler>,

    pub(crate) password_handler: Option<PasswordHandler>,
    pub(crate) password_handler_explicit: Option<PasswordHandlerExplicit>,
    pub(crate) public_key_handler: Option<PublicKeyHandler>,
    pub(crate) keyboard_interactive_handler: Option<KeyboardInteractiveHandler>,

    pub(crate) pty_callback: Option<PtyCallback>,
    pub(crate) pty_mode: PtyMode,
    pub(crate) channel_open_callback: Option<ChannelOpenCallback>,
    pub(crate) session_request_callback: Option<SessionRequestCallback>,
    pub(crate) conn_callback: Option<ConnCallback>,

    pub(crate) local_port_forwarding_callback: Option<LocalPortForwardingCallback>,
    pub(crate) reverse_port_forwarding_callback: Option<ReversePortForwardingCallback>,
    #[cfg(unix)]
    pub(crate) local_unix_forwarding_callback: Option<LocalUnixForwardingCallback>,
    #[cfg(unix)]
    pub(crate) reverse_unix_forwarding_callback: Option<ReverseUnixForwardingCallback>,

    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_timeout: Option<Duration>,
}

impl ServerConfig {
    fn new(handler: SessionHandler) -> Self {
        ServerConfig {
            addr: "0.0.0.0:22".to_string(),
            version: None,
            banner: None,
            host_keys: Vec::new(),
            handler,
            subsystem_handlers: HashMap::new(),
            password_handler: None,
            password_handler_explicit: None,
            public_key_handler: None,
            keyboard_interactive_handler: None,
            pty_callback: None,
            pty_mode: PtyMode::Emulated,
            channel_open_callback: None,
            session_request_callback: None,
            conn_callback: None,
            local_port_forwarding_callback: None,
            reverse_port_forwarding_callback: None,
            #[cfg(unix)]
            local_unix_forwarding_callback: None,
            #[cfg(unix)]
            reverse_unix_forwarding_callback: None,
            idle_timeout: None,
            max_timeout: None,
        }
    }

    fn snapshot(&self) -> ServerConfig {
        ServerConfig {
            addr: self.addr.clone(),
            version: self.version.clone(),
            banner: self.banner.clone(),
            host_keys: self.host_keys.clone(),
            handler: self.handler.clone(),
            subsystem_handlers: self.subsystem_handlers.clone(),
            password_handler: self.password_handler.clone(),
            password_handler_explicit: self.password_handler_explicit.clone(),
            public_key_handler: self.public_key_handler.clone(),
            keyboard_interactive_handler: self.keyboard_interactive_handler.clone(),
            pty_callback: self.pty_callback.clone(),
            pty_mode: self.pty_mode,
            channel_open_callback: self.channel_open_callback.clone(),
            session_request_callback: self.session_request_callback.clone(),
            conn_callback: self.conn_callback.clone(),
            local_port_forwarding_callback: self.local_port_forwarding_callback.clone(),
            reverse_port_forwarding_callback: self.reverse_port_forwarding_callback.clone(),
            #[cfg(unix)]
            local_unix_forwarding_callback: self.local_unix_forwarding_callback.clone(),
            #[cfg(unix)]
            reverse_unix_forwarding_callback: self.reverse_unix_forwarding_callback.clone(),
            idle_timeout: self.idle_timeout,
            max_timeout: self.max_timeout,
        }
    }

    pub(crate) fn auth_methods(&self) -> Option<MethodSet> {
        let mut kinds = Vec::new();
        if self.password_handler.is_some() || self.password_handler_explicit.is_some() {
            kinds.push(MethodKind::Password);
        }
        if self.public_key_handler.is_some() {
            kinds.push(MethodKind::PublicKey);
        }
        if self.keyboard_interactive_handler.is_some() {
            kinds.push(MethodKind::KeyboardInteractive);
        }
        if kinds.is_empty() {
            None
        } else {
            Some(MethodSet::from(kinds.as_slice()))
        }
    }
}

struct ServerState {
    /// Fired by `close`/`shutdown`; accepting stops and accept errors are
    /// no longer fatal.
    close_signal: CancellationToken,
    conns: Mutex<HashMap<u64, CancellationToken>>,
    serving: AtomicBool,
    stopped: AtomicBool,
    next_conn_id: AtomicU64,
}

/// The SSH server: configuration plus the runtime registries (live
/// connections, close signal).
///
/// Cloning shares the same server; a clone observes and controls the same
/// lifecycle.
#[derive(Clone)]
pub struct Server {
    cfg: Arc<Mutex<ServerConfig>>,
    state: Arc<ServerState>,
}

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl Server {
    /// Creates a server that runs `handler` for every accepted
    /// `shell`/`exec` session.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Server::with_handler(handler_fn(handler))
    }

    pub fn with_handler(handler: SessionHandler) -> Self {
        Server {
            cfg: Arc::new(Mutex::new(ServerConfig::new(handler))),
            state: Arc::new(ServerState {
                close_signal: CancellationToken::new(),
                conns: Mutex::new(HashMap::new()),
                serving: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(0),
            }),
        }
    }

    /// Applies a functional option. Only valid before the server starts
    /// serving.
    pub fn set_option(&self, option: options::ServerOption) -> Result<()> {
        if self.state.serving.load(Ordering::SeqCst) {
            return Err(Error::Configuration(
                "options cannot be applied while serving".into(),
            ));
        }
        option(&mut self.cfg.lock().unwrap())
    }

    /// Appends a host key. The transport keeps one key per algorithm,
    /// later keys overriding earlier ones.
    pub fn add_host_key(&self, key: PrivateKey) {
        self.cfg.lock().unwrap().host_keys.push(key);
    }

    /// Number of live (handshake-complete, not yet closed) connections.
    pub fn live_connections(&self) -> usize {
        self.state.conns.lock().unwrap().len()
    }

    /// Binds the configured address (`0.0.0.0:22` unless overridden) and
    /// serves until closed.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let addr = self.cfg.lock().unwrap().addr.clone();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Accept loop. Returns [`Error::ServerClosed`] after `close` or
    /// `shutdown`; transient accept errors back off (5 ms doubling, capped
    /// at 1 s, reset on the next success), permanent ones propagate.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.state.close_signal.is_cancelled() {
            return Err(Error::ServerClosed);
        }
        self.state.serving.store(true, Ordering::SeqCst);

        let russh_config = {
            let mut cfg = self.cfg.lock().unwrap();
            if cfg.host_keys.is_empty() {
                cfg.host_keys.push(auth::generate_host_key()?);
            }
            Arc::new(build_transport_config(&cfg))
        };
        let server_version = match &russh_config.server_id {
            SshId::Standard(id) => id.clone(),
            _ => String::new(),
        };
        let snapshot = Arc::new(self.cfg.lock().unwrap().snapshot());

        info!(
            "serving ssh on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );

        let mut backoff: Option<Duration> = None;
        loop {
            tokio::select! {
                _ = self.state.close_signal.cancelled() => return Err(Error::ServerClosed),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            backoff = None;
                            let local_addr = stream
                                .local_addr()
                                .unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
                            let server = self.clone();
                            let cfg = snapshot.clone();
                            let russh_config = russh_config.clone();
                            let server_version = server_version.clone();
                            tokio::spawn(async move {
                                server
                                    .handle_conn(
                                        cfg,
                                        russh_config,
                                        server_version,
                                        Box::new(stream),
                                        peer_addr,
                                        local_addr,
                                    )
                                    .await;
                            });
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            let delay = match backoff {
                                None => Duration::from_millis(5),
                                Some(d) => (d * 2).min(Duration::from_secs(1)),
                            };
                            backoff = Some(delay);
                            warn!(error = %e, ?delay, "transient accept failure, backing off");
                            tokio::time::sleep(delay).await;
                        }
                        Err(e) => {
                            if self.state.close_signal.is_cancelled() {
                                return Err(Error::ServerClosed);
                            }
                            error!("accept failed: {}", e);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    async fn handle_conn(
        &self,
        cfg: Arc<ServerConfig>,
        russh_config: Arc<russh::server::Config>,
        server_version: String,
        stream: BoxedStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) {
        let conn_id = self.state.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(conn = conn_id, peer = %peer_addr, "connection accepted");

        let stream = match &cfg.conn_callback {
            Some(cb) => match cb(stream) {
                Some(s) => s,
                None => {
                    debug!(conn = conn_id, "connection dropped by conn callback");
                    return;
                }
            },
            None => stream,
        };

        let ctx = Context::new(conn_id, peer_addr, local_addr, server_version);
        let activity = Activity::new();
        let wrapped = DeadlineStream::new(stream, activity.clone(), ctx.clone());

        if cfg.idle_timeout.is_some() || cfg.max_timeout.is_some() {
            spawn_deadline_watchdog(ctx.clone(), activity, cfg.idle_timeout, cfg.max_timeout);
        }

        let handler = ConnHandler::new(cfg, ctx.clone());
        let running = match russh::server::run_stream(russh_config, wrapped, handler).await {
            Ok(running) => running,
            Err(e) => {
                debug!(conn = conn_id, error = %e, "handshake failed");
                ctx.cancel();
                return;
            }
        };

        // Handshake-level success: the connection joins the live set and
        // stays there until its driver finishes or its context is
        // cancelled (close, timeout, stream error).
        self.state
            .conns
            .lock()
            .unwrap()
            .insert(conn_id, ctx.cancellation_token());

        tokio::select! {
            result = running => {
                match result {
                    Ok(()) => trace!(conn = conn_id, "connection finished"),
                    Err(e) => debug!(conn = conn_id, error = %e, "connection error"),
                }
            }
            _ = ctx.cancelled() => {
                debug!(conn = conn_id, "connection cancelled");
            }
        }

        ctx.cancel();
        self.state.conns.lock().unwrap().remove(&conn_id);
        debug!(conn = conn_id, "connection removed");
    }

    /// Immediately closes all listeners and live connections. Idempotent.
    pub fn close(&self) {
        if self.state.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server closing");
        self.state.close_signal.cancel();
        let conns = self.state.conns.lock().unwrap();
        for (id, token) in conns.iter() {
            trace!(conn = id, "cancelling connection");
            token.cancel();
        }
    }

    /// Stops accepting and waits (polling every 500 ms) for live
    /// connections to finish on their own. Returns
    /// [`Error::DeadlineExceeded`] if `deadline` elapses first, and
    /// [`Error::ServerClosed`] when the server was already stopped.
    pub async fn shutdown(&self, deadline: Option<Duration>) -> Result<()> {
        if self.state.stopped.load(Ordering::SeqCst) {
            return Err(Error::ServerClosed);
        }
        info!("server shutting down");
        self.state.close_signal.cancel();

        let deadline_at = deadline.map(|d| Instant::now() + d);
        loop {
            if self.live_connections() == 0 {
                self.state.stopped.store(true, Ordering::SeqCst);
                return Ok(());
            }
            let sleep_for = match deadline_at {
                Some(at) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::DeadlineExceeded);
                    }
                    remaining.min(SHUTDOWN_POLL_INTERVAL)
                }
                None => SHUTDOWN_POLL_INTERVAL,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }
}

fn build_transport_config(cfg: &ServerConfig) -> russh::server::Config {
    let mut config = russh::server::Config::default();
    for key in &cfg.host_keys {
        config.keys.push(key.clone());
    }
    if let Some(version) = &cfg.version {
        config.server_id = SshId::Standard(format!("SSH-2.0-{}", version));
    }
    config.methods = cfg
        .auth_methods()
        .unwrap_or_else(|| MethodSet::from([MethodKind::None].as_slice()));
    config.auth_rejection_time = Duration::from_millis(200);
    config.auth_rejection_time_initial = Some(Duration::ZERO);
    config.max_auth_attempts = 3;
    config
}

fn spawn_deadline_watchdog(
    ctx: Context,
    activity: Activity,
    idle_timeout: Option<Duration>,
    max_timeout: Option<Duration>,
) {
    let max_deadline = max_timeout.map(|d| Instant::now() + d);
    tokio::spawn(async move {
        loop {
            let idle_deadline = idle_timeout.map(|d| Instant::from_std(activity.last() + d));
            let deadline = match (idle_deadline, max_deadline) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => return,
            };
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    // Activity may have pushed the idle deadline out since
                    // this sleep was armed.
                    let now = Instant::now();
                    let still_due = match (idle_timeout, max_deadline) {
                        (_, Some(max)) if now >= max => true,
                        (Some(idle), _) => Instant::from_std(activity.last() + idle) <= now,
                        _ => false,
                    };
                    if still_due {
                        debug!(conn = ctx.session_id(), "connection deadline exceeded");
                        ctx.cancel();
                        return;
                    }
                }
                _ = ctx.cancelled() => return,
            }
        }
    });
}

fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::Interrupted
    ) || matches!(e.raw_os_error(), Some(23) | Some(24)) // ENFILE / EMFILE
}
