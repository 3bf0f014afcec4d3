//! The per-channel session: request state machine and the handle user
//! handlers receive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use russh::ChannelId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::pty::{normalize_newlines, Pty, Window};

/// POSIX signal names as carried by `signal` session requests
/// (RFC 4254 §6.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    USR2,
    Custom(String),
}

impl Signal {
    pub fn name(&self) -> &str {
        match self {
            Signal::ABRT => "ABRT",
            Signal::ALRM => "ALRM",
            Signal::FPE => "FPE",
            Signal::HUP => "HUP",
            Signal::ILL => "ILL",
            Signal::INT => "INT",
            Signal::KILL => "KILL",
            Signal::PIPE => "PIPE",
            Signal::QUIT => "QUIT",
            Signal::SEGV => "SEGV",
            Signal::TERM => "TERM",
            Signal::USR1 => "USR1",
            Signal::USR2 => "USR2",
            Signal::Custom(name) => name,
        }
    }
}

impl From<russh::Sig> for Signal {
    fn from(sig: russh::Sig) -> Self {
        use russh::Sig;
        match sig {
            Sig::ABRT => Signal::ABRT,
            Sig::ALRM => Signal::ALRM,
            Sig::FPE => Signal::FPE,
            Sig::HUP => Signal::HUP,
            Sig::ILL => Signal::ILL,
            Sig::INT => Signal::INT,
            Sig::KILL => Signal::KILL,
            Sig::PIPE => Signal::PIPE,
            Sig::QUIT => Signal::QUIT,
            Sig::SEGV => Signal::SEGV,
            Sig::TERM => Signal::TERM,
            Sig::USR1 => Signal::USR1,
            Sig::Custom(name) if name == "USR2" => Signal::USR2,
            Sig::Custom(name) => Signal::Custom(name),
        }
    }
}

/// What a `shell`/`exec`/`subsystem` transition decided.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Invocation {
    /// Reply success and run the user handler.
    Handler,
    /// Reply success and run the named subsystem handler.
    Subsystem(String),
    /// Reply failure; the channel already has a running handler, the
    /// request was vetoed, or the subsystem is unknown.
    Refused,
}

/// Mutable per-channel state driven by incoming requests.
///
/// Transitions are synchronous and transport-free so they can be tested
/// directly; the connection handler calls them and converts the returned
/// decision into a wire reply.
#[derive(Default)]
pub(crate) struct SessionState {
    env: Vec<String>,
    raw_command: Option<String>,
    command: Vec<String>,
    subsystem: Option<String>,
    pty: Option<Pty>,
    window_tx: Option<watch::Sender<Window>>,
    window_rx: Option<watch::Receiver<Window>>,
    signal_tx: Option<mpsc::UnboundedSender<Signal>>,
    break_tx: Option<mpsc::UnboundedSender<bool>>,
    handled: bool,
    #[cfg(unix)]
    allocation: Option<crate::pty::PtyAllocation>,
}

impl SessionState {
    /// `env`: collect `KEY=VALUE` in arrival order. Refused once the
    /// handler has started.
    pub(crate) fn on_env(&mut self, name: &str, value: &str) -> bool {
        if self.handled {
            return false;
        }
        self.env.push(format!("{}={}", name, value));
        true
    }

    /// `pty-req` (already past the permission callback): store the
    /// descriptor and open the window-change channel.
    pub(crate) fn on_pty_request(&mut self, pty: Pty) -> bool {
        if self.handled {
            return false;
        }
        let (tx, rx) = watch::channel(pty.window);
        self.pty = Some(pty);
        self.window_tx = Some(tx);
        self.window_rx = Some(rx);
        true
    }

    /// `window-change`: refused when no PTY was acquired; otherwise the
    /// descriptor is updated and the new size published without blocking
    /// (stale sizes are overwritten if the handler is not draining).
    pub(crate) fn on_window_change(&mut self, window: Window) -> bool {
        let Some(pty) = self.pty.as_mut() else {
            return false;
        };
        pty.window = window;
        #[cfg(unix)]
        if let Some(alloc) = &self.allocation {
            alloc.resize(window);
        }
        if let Some(tx) = &self.window_tx {
            let _ = tx.send(window);
        }
        true
    }

    /// Attaches a real PTY pair to this session after an accepted
    /// `pty-req` in allocated mode.
    #[cfg(unix)]
    pub(crate) fn set_allocation(&mut self, allocation: crate::pty::PtyAllocation) {
        self.allocation = Some(allocation);
    }

    /// `shell`: an empty command vector.
    pub(crate) fn on_shell(&mut self, vetoed: bool) -> Invocation {
        if self.handled || vetoed {
            return Invocation::Refused;
        }
        self.handled = true;
        self.raw_command = None;
        self.command = Vec::new();
        Invocation::Handler
    }

    /// `exec`: POSIX-shell split of the payload; an empty result is a
    /// shell.
    pub(crate) fn on_exec(&mut self, raw: &str, vetoed: bool) -> Invocation {
        if self.handled || vetoed {
            return Invocation::Refused;
        }
        self.handled = true;
        self.raw_command = Some(raw.to_string());
        self.command = shlex::split(raw).unwrap_or_default();
        Invocation::Handler
    }

    /// `subsystem`: dispatch to the registered handler, if any.
    pub(crate) fn on_subsystem(&mut self, name: &str, registered: bool, vetoed: bool) -> Invocation {
        if self.handled || vetoed || !registered {
            return Invocation::Refused;
        }
        self.handled = true;
        self.subsystem = Some(name.to_string());
        Invocation::Subsystem(name.to_string())
    }

    /// `signal`: fan out to the registered receiver, dropped otherwise.
    pub(crate) fn on_signal(&mut self, signal: Signal) {
        if let Some(tx) = &self.signal_tx {
            if tx.send(signal).is_err() {
                self.signal_tx = None;
            }
        }
    }

    /// `break`: true when a receiver took delivery.
    pub(crate) fn on_break(&mut self) -> bool {
        match &self.break_tx {
            Some(tx) if tx.send(true).is_ok() => true,
            _ => {
                self.break_tx = None;
                false
            }
        }
    }

    pub(crate) fn has_pty(&self) -> bool {
        self.pty.is_some()
    }
}

struct SessionShared {
    ctx: Context,
    channel_id: ChannelId,
    handle: russh::server::Handle,
    state: Mutex<SessionState>,
    exited: AtomicBool,
    closed: AtomicBool,
    input: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

/// Handle to an accepted `session` channel, passed to the user handler.
///
/// Reads come from [`Session::recv`] (or a [`SessionReader`]); writes go to
/// the client's stdout/stderr, with `\n` → `\r\n` normalization once a PTY
/// has been accepted. The handle is cheap to clone and all clones share
/// state.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(
        ctx: Context,
        channel_id: ChannelId,
        handle: russh::server::Handle,
        state: SessionState,
        input: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Session {
            shared: Arc::new(SessionShared {
                ctx,
                channel_id,
                handle,
                state: Mutex::new(state),
                exited: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                input: tokio::sync::Mutex::new(Some(input)),
            }),
        }
    }

    /// The connection context this session belongs to.
    pub fn context(&self) -> &Context {
        &self.shared.ctx
    }

    pub fn user(&self) -> String {
        self.shared.ctx.user()
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.shared.ctx.remote_addr()
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.shared.ctx.local_addr()
    }

    pub fn public_key(&self) -> Option<russh::keys::PublicKey> {
        self.shared.ctx.public_key()
    }

    /// Environment set via `env` requests before the handler ran, as
    /// `KEY=VALUE` strings in arrival order.
    pub fn environ(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().env.clone()
    }

    /// Shell-parsed command vector; empty means the client asked for a
    /// shell.
    pub fn command(&self) -> Vec<String> {
        self.shared.state.lock().unwrap().command.clone()
    }

    /// The unparsed `exec` payload, when the session came from `exec`.
    pub fn raw_command(&self) -> Option<String> {
        self.shared.state.lock().unwrap().raw_command.clone()
    }

    /// Subsystem name, when the session came from a `subsystem` request.
    pub fn subsystem(&self) -> Option<String> {
        self.shared.state.lock().unwrap().subsystem.clone()
    }

    /// PTY descriptor and window-change receiver, if a PTY was accepted.
    ///
    /// The receiver always reports the latest window; intermediate sizes
    /// are dropped rather than queued.
    pub fn pty(&self) -> Option<(Pty, watch::Receiver<Window>)> {
        let state = self.shared.state.lock().unwrap();
        match (&state.pty, &state.window_rx) {
            (Some(pty), Some(rx)) => Some((pty.clone(), rx.clone())),
            _ => None,
        }
    }

    /// Registers for `signal` requests. At most one receiver is active;
    /// calling again replaces the previous registration.
    pub fn signals(&self) -> mpsc::UnboundedReceiver<Signal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().unwrap().signal_tx = Some(tx);
        rx
    }

    /// Deregisters the signal receiver.
    pub fn stop_signals(&self) {
        self.shared.state.lock().unwrap().signal_tx = None;
    }

    /// Registers for `break` requests, replacing any previous receiver.
    pub fn breaks(&self) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.state.lock().unwrap().break_tx = Some(tx);
        rx
    }

    pub fn stop_breaks(&self) {
        self.shared.state.lock().unwrap().break_tx = None;
    }

    /// Next chunk of input from the client, `None` at EOF.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut guard = self.shared.input.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Takes the input stream as an `AsyncRead`. Can be taken once; after
    /// this, [`Session::recv`] returns `None`.
    pub async fn take_reader(&self) -> Option<SessionReader> {
        self.shared
            .input
            .lock()
            .await
            .take()
            .map(|rx| SessionReader {
                rx,
                buf: BytesMut::new(),
            })
    }

    /// Writes to the client's standard output.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let data = if self.shared.state.lock().unwrap().has_pty() {
            normalize_newlines(data)
        } else {
            data.to_vec()
        };
        self.shared
            .handle
            .data(self.shared.channel_id, data.into())
            .await
            .map_err(|_| Error::Transport(russh::Error::SendError))
    }

    /// Writes to the client's standard error stream.
    pub async fn write_stderr(&self, data: &[u8]) -> Result<()> {
        self.shared
            .handle
            .extended_data(self.shared.channel_id, 1, data.to_vec().into())
            .await
            .map_err(|_| Error::Transport(russh::Error::SendError))
    }

    /// Sends `exit-status` and closes the channel. The status goes on the
    /// wire at most once and is the last event before the close; further
    /// calls return [`Error::AlreadyExited`].
    pub async fn send_exit(&self, code: u32) -> Result<()> {
        if self.shared.exited.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyExited);
        }
        self.shared
            .handle
            .exit_status_request(self.shared.channel_id, code)
            .await
            .map_err(|_| Error::Transport(russh::Error::SendError))?;
        self.close().await
    }

    /// True once an exit status has been sent.
    pub fn exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    /// Closes the channel without an exit status.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared
            .handle
            .close(self.shared.channel_id)
            .await
            .map_err(|_| Error::Transport(russh::Error::SendError))
    }

    /// Spawns `cmd` on the session's allocated PTY, attached to the slave
    /// side as its controlling terminal. Fails with
    /// [`Error::Unsupported`] when the session has no allocated PTY.
    #[cfg(unix)]
    pub fn start(&self, cmd: &mut tokio::process::Command) -> Result<tokio::process::Child> {
        self.with_state(|state| match state.allocation.as_mut() {
            Some(alloc) => alloc.start(cmd),
            None => Err(Error::Unsupported),
        })
    }

    /// Bridges the allocated PTY to this session: master output is pumped
    /// to the client and client input to the master. Consumes the
    /// session's input stream.
    #[cfg(unix)]
    pub async fn pipe_to_pty(&self) -> Result<()> {
        let (master_read, master_write) =
            self.with_state(|state| match state.allocation.as_ref() {
                Some(alloc) => alloc.split_master(),
                None => Err(Error::Unsupported),
            })?;
        let handle = self.shared.handle.clone();
        let channel_id = self.shared.channel_id;
        tokio::spawn(async move {
            crate::utils::pipe_read_to_ssh(master_read, handle, channel_id, "pty to channel").await;
        });

        let Some(rx) = self.shared.input.lock().await.take() else {
            warn!("session input already taken; pty gets no stdin");
            return Ok(());
        };
        tokio::spawn(async move {
            crate::utils::pipe_rx_to_write(rx, master_write, "channel to pty").await;
        });
        Ok(())
    }

    pub(crate) fn channel_id(&self) -> ChannelId {
        self.shared.channel_id
    }

    pub(crate) fn handle(&self) -> russh::server::Handle {
        self.shared.handle.clone()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.shared.state.lock().unwrap())
    }

    /// Runs the user (or subsystem) handler to completion, then guarantees
    /// the exit-status contract: a handler that returns without exiting
    /// gets `exit-status 0` sent on its behalf, and a handler that
    /// panicked is logged and its channel dropped without taking the
    /// server down.
    pub(crate) async fn drive<F>(self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let outcome = tokio::spawn(fut).await;
        match outcome {
            Ok(()) => {
                if !self.exited() {
                    let _ = self.send_exit(0).await;
                }
            }
            Err(e) => {
                warn!(channel = ?self.shared.channel_id, error = %e, "session handler aborted");
                let _ = self.close().await;
            }
        }
        debug!(channel = ?self.shared.channel_id, "session handler finished");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.shared.channel_id)
            .field("user", &self.user())
            .field("command", &self.command())
            .finish()
    }
}

/// `AsyncRead` over the session's input stream.
pub struct SessionReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    buf: BytesMut,
}

impl tokio::io::AsyncRead for SessionReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::task::Poll;

        if !self.buf.is_empty() {
            let n = buf.remaining().min(self.buf.len());
            buf.put_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = buf.remaining().min(data.len());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.buf.extend_from_slice(&data[n..]);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}
