//! Unix-socket forwarding: `direct-streamlocal@openssh.com` channels and
//! `streamlocal-forward@openssh.com` (reverse) forwards.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use russh::server::Msg;
use russh::Channel;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::utils::bridge;

/// Gate for `direct-streamlocal@openssh.com`: `(context, socket path)`.
/// Denied when unset.
pub type LocalUnixForwardingCallback = Arc<dyn Fn(&Context, &str) -> bool + Send + Sync>;

/// Callback servicing `streamlocal-forward@openssh.com`: produce the Unix
/// listener to forward from, or an error to refuse
/// ([`Error::Rejected`] means "disabled"). Denied when unset.
pub type ReverseUnixForwardingCallback =
    Arc<dyn Fn(&Context, &str) -> Result<UnixListener> + Send + Sync>;

/// Dials the target socket of an accepted direct-streamlocal channel and
/// bridges it.
pub(crate) async fn handle_direct_streamlocal(
    ctx: &Context,
    channel: Channel<Msg>,
    socket_path: &str,
) -> bool {
    debug!(socket_path, "direct-streamlocal open");
    let stream = tokio::select! {
        r = UnixStream::connect(socket_path) => r,
        _ = ctx.cancelled() => return false,
    };
    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            error!(socket_path, error = %e, "direct-streamlocal dial failed");
            return false;
        }
    };

    let cancel = ctx.cancellation_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = bridge(channel.into_stream(), stream, "direct-streamlocal") => {}
            _ = cancel.cancelled() => {}
        }
    });
    true
}

/// Per-connection registry of reverse Unix forwards, keyed by socket path.
pub(crate) struct ForwardedUnixHandler {
    forwards: Mutex<HashMap<String, mpsc::UnboundedSender<()>>>,
}

impl ForwardedUnixHandler {
    pub(crate) fn new() -> Self {
        ForwardedUnixHandler {
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// Services `streamlocal-forward@openssh.com` with a listener the
    /// reverse-Unix callback produced.
    pub(crate) async fn streamlocal_forward(
        self: Arc<Self>,
        ctx: &Context,
        handle: russh::server::Handle,
        socket_path: &str,
        listener: UnixListener,
    ) -> bool {
        let key = socket_path.to_string();
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        {
            let mut forwards = self.forwards.lock().await;
            if forwards.contains_key(&key) {
                warn!(socket_path, "duplicate reverse unix forward");
                return false;
            }
            forwards.insert(key.clone(), shutdown_tx);
        }
        info!(socket_path, "reverse unix forward listening");

        let path = socket_path.to_string();
        let cancel = ctx.cancellation_token();
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _peer)) => {
                                let handle = handle.clone();
                                let path = path.clone();
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    let channel = match handle
                                        .channel_open_forwarded_streamlocal(&path)
                                        .await
                                    {
                                        Ok(c) => c,
                                        Err(e) => {
                                            error!(error = ?e, "forwarded-streamlocal open failed");
                                            return;
                                        }
                                    };
                                    tokio::select! {
                                        _ = bridge(channel.into_stream(), stream, "forwarded-streamlocal") => {}
                                        _ = cancel.cancelled() => {}
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "reverse unix accept failed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(%path, "reverse unix forward cancelled");
                        break;
                    }
                    _ = cancel.cancelled() => {
                        debug!(%path, "connection ended, closing reverse unix forward");
                        break;
                    }
                }
            }
            registry.forwards.lock().await.remove(&key);
        });
        true
    }

    /// Services `cancel-streamlocal-forward@openssh.com`.
    pub(crate) async fn cancel_streamlocal_forward(&self, socket_path: &str) -> bool {
        let mut forwards = self.forwards.lock().await;
        match forwards.remove(socket_path) {
            Some(shutdown_tx) => {
                let _ = shutdown_tx.send(());
                info!(socket_path, "reverse unix forward removed");
                true
            }
            None => {
                warn!(socket_path, "no reverse unix forward to cancel");
                false
            }
        }
    }

    pub(crate) async fn close_all(&self) {
        let mut forwards = self.forwards.lock().await;
        for (path, shutdown_tx) in forwards.drain() {
            debug!(%path, "closing reverse unix forward");
            let _ = shutdown_tx.send(());
        }
    }
}

/// Ready-made [`ReverseUnixForwardingCallback`] body: creates the socket's
/// parent directories (mode 0700), removes a stale socket file, and binds.
/// Matches OpenSSH behavior: existing regular files are unlinked, but
/// directories and other non-file entries are refused.
pub fn simple_unix_reverse_callback(_ctx: &Context, socket_path: &str) -> Result<UnixListener> {
    let path = Path::new(socket_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    unlink_stale(path)?;
    Ok(UnixListener::bind(path)?)
}

/// Removes `path` if it is a socket, symlink, or regular file, retrying
/// `EINTR`. Directories are kept (and reported as an error).
fn unlink_stale(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::Io(e)),
        Ok(md) if md.is_dir() => {
            return Err(Error::Io(io::Error::other(format!(
                "refusing to remove directory at socket path {}",
                path.display()
            ))));
        }
        Ok(_) => {}
    }
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::Parse("socket path"))?;
    loop {
        if unsafe { nix::libc::unlink(cpath.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == nix::libc::EINTR => continue,
            Some(code) if code == nix::libc::ENOENT => return Ok(()),
            _ => return Err(Error::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> Context {
        Context::new(
            1,
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:2222".parse().unwrap(),
            "SSH-2.0-test".into(),
        )
    }

    #[tokio::test]
    async fn simple_callback_creates_parents_and_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("nested/agent/forward.sock");
        let ctx = test_context();

        let first = simple_unix_reverse_callback(&ctx, sock.to_str().unwrap()).unwrap();
        assert!(sock.exists());
        drop(first);

        // A dead socket file from the previous bind is unlinked.
        let second = simple_unix_reverse_callback(&ctx, sock.to_str().unwrap());
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn simple_callback_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("taken");
        std::fs::create_dir(&sock).unwrap();
        let ctx = test_context();
        assert!(simple_unix_reverse_callback(&ctx, sock.to_str().unwrap()).is_err());
    }

    #[test]
    fn unlink_stale_ignores_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unlink_stale(&dir.path().join("never-existed")).is_ok());
    }

    #[test]
    fn unlink_stale_removes_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        std::fs::write(&path, b"x").unwrap();
        unlink_stale(&path).unwrap();
        assert!(!path.exists());
    }
}
