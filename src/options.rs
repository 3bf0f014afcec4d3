//! Functional server options, applied with
//! [`Server::set_option`](crate::Server::set_option).

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{self, InteractiveDecision};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pty::{Pty, PtyMode};
use crate::session::Session;
use crate::{handler_fn, BoxedStream, ServerConfig};

/// A deferred configuration mutation; fails when its input is invalid
/// (e.g. an unreadable host key file).
pub type ServerOption = Box<dyn FnOnce(&mut ServerConfig) -> Result<()> + Send>;

/// Sets the listen address for
/// [`listen_and_serve`](crate::Server::listen_and_serve).
pub fn addr(addr: impl Into<String>) -> ServerOption {
    let addr = addr.into();
    Box::new(move |cfg| {
        cfg.addr = addr;
        Ok(())
    })
}

/// Sets the version announced before the handshake; the wire string
/// becomes `SSH-2.0-<version>`.
pub fn version(version: impl Into<String>) -> ServerOption {
    let version = version.into();
    Box::new(move |cfg| {
        cfg.version = Some(version);
        Ok(())
    })
}

/// Sets a banner shown to clients before authentication.
pub fn banner(banner: impl Into<String>) -> ServerOption {
    let banner = banner.into();
    Box::new(move |cfg| {
        cfg.banner = Some(banner);
        Ok(())
    })
}

/// Enables password authentication with a boolean callback.
pub fn password_auth<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.password_handler = Some(Arc::new(f));
        Ok(())
    })
}

/// Enables password authentication with an error-returning callback; an
/// `Err` rejects, and [`Error::PermissionDenied`] with `partial_success`
/// marks partial authentication.
pub fn password_auth_explicit<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str) -> Result<()> + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.password_handler_explicit = Some(Arc::new(f));
        Ok(())
    })
}

/// Enables public-key authentication.
pub fn public_key_auth<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &russh::keys::PublicKey) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.public_key_handler = Some(Arc::new(f));
        Ok(())
    })
}

/// Enables keyboard-interactive authentication; see
/// [`KeyboardInteractiveHandler`](crate::KeyboardInteractiveHandler) for
/// the round-driven contract.
pub fn keyboard_interactive_auth<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str, Option<Vec<String>>) -> InteractiveDecision + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.keyboard_interactive_handler = Some(Arc::new(f));
        Ok(())
    })
}

/// Loads host keys from a PEM/OpenSSH file. Undecodable content fails
/// option application.
pub fn host_key_file(path: impl Into<PathBuf>) -> ServerOption {
    let path = path.into();
    Box::new(move |cfg| {
        let pem = std::fs::read_to_string(&path)
            .map_err(|e| Error::Configuration(format!("read {}: {e}", path.display())))?;
        cfg.host_keys.push(auth::decode_host_key(&pem)?);
        Ok(())
    })
}

/// Adds a host key from PEM/OpenSSH bytes.
pub fn host_key_pem(pem: impl AsRef<[u8]>) -> ServerOption {
    let pem = pem.as_ref().to_vec();
    Box::new(move |cfg| {
        let text = std::str::from_utf8(&pem)
            .map_err(|_| Error::Configuration("host key PEM is not utf-8".into()))?;
        cfg.host_keys.push(auth::decode_host_key(text)?);
        Ok(())
    })
}

/// Refuses every `pty-req`.
pub fn no_pty() -> ServerOption {
    Box::new(|cfg| {
        cfg.pty_callback = Some(Arc::new(|_, _| false));
        Ok(())
    })
}

/// Backs accepted PTY requests with a kernel PTY pair (Unix only; on
/// other platforms requests fail at allocation time).
pub fn allocate_pty() -> ServerOption {
    Box::new(|cfg| {
        cfg.pty_mode = PtyMode::Allocated;
        Ok(())
    })
}

/// Accepts PTY requests without allocating a kernel PTY; sessions get
/// newline normalization and window-change delivery. This is the default.
pub fn emulate_pty() -> ServerOption {
    Box::new(|cfg| {
        cfg.pty_mode = PtyMode::Emulated;
        Ok(())
    })
}

/// Gates `pty-req` with a callback receiving the parsed request.
pub fn pty_callback<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &Pty) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.pty_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Wraps (or drops) the raw connection stream before the handshake.
pub fn wrap_conn<F>(f: F) -> ServerOption
where
    F: Fn(BoxedStream) -> Option<BoxedStream> + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.conn_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Gates channel opens by channel type.
pub fn channel_open_callback<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.channel_open_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Vetoes `shell`/`exec`/`subsystem` requests before dispatch.
pub fn session_request_callback<F>(f: F) -> ServerOption
where
    F: Fn(&Session, &str) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.session_request_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Registers a subsystem handler (e.g. `sftp`).
pub fn subsystem<F, Fut>(name: impl Into<String>, f: F) -> ServerOption
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    Box::new(move |cfg| {
        cfg.subsystem_handlers.insert(name, handler_fn(f));
        Ok(())
    })
}

/// Allows `direct-tcpip` (client-to-server) forwarding.
pub fn local_port_forwarding<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str, u32) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.local_port_forwarding_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Allows `tcpip-forward` (server-listening reverse) forwarding.
pub fn reverse_port_forwarding<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str, u32) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.reverse_port_forwarding_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Allows `direct-streamlocal@openssh.com` (client-to-server Unix socket)
/// forwarding.
#[cfg(unix)]
pub fn local_unix_forwarding<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str) -> bool + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.local_unix_forwarding_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Allows `streamlocal-forward@openssh.com` (reverse Unix socket)
/// forwarding; the callback produces the listener. See
/// [`simple_unix_reverse_callback`](crate::simple_unix_reverse_callback)
/// for a ready-made implementation.
#[cfg(unix)]
pub fn reverse_unix_forwarding<F>(f: F) -> ServerOption
where
    F: Fn(&Context, &str) -> Result<tokio::net::UnixListener> + Send + Sync + 'static,
{
    Box::new(move |cfg| {
        cfg.reverse_unix_forwarding_callback = Some(Arc::new(f));
        Ok(())
    })
}

/// Cancels connections with no traffic for `timeout`.
pub fn idle_timeout(timeout: Duration) -> ServerOption {
    Box::new(move |cfg| {
        cfg.idle_timeout = Some(timeout);
        Ok(())
    })
}

/// Cancels connections older than `timeout` regardless of activity.
pub fn max_timeout(timeout: Duration) -> ServerOption {
    Box::new(move |cfg| {
        cfg.max_timeout = Some(timeout);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Server;

    #[test]
    fn host_key_file_rejects_missing_path() {
        let server = Server::new(|_s| async {});
        let result = server.set_option(host_key_file("/definitely/not/a/key"));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn host_key_pem_round_trips_generated_key() {
        use russh::keys::ssh_key::LineEnding;
        let key = auth::generate_host_key().unwrap();
        let pem = key.to_openssh(LineEnding::LF).unwrap();
        let server = Server::new(|_s| async {});
        server.set_option(host_key_pem(pem.as_bytes())).unwrap();
    }

    #[test]
    fn host_key_pem_rejects_unknown_block() {
        let server = Server::new(|_s| async {});
        let result = server.set_option(host_key_pem(
            b"-----BEGIN SOMETHING ELSE-----\nAAAA\n-----END SOMETHING ELSE-----\n",
        ));
        assert!(result.is_err());
    }

    #[test]
    fn options_apply_in_order() {
        let server = Server::new(|_s| async {});
        server.set_option(version("one")).unwrap();
        server.set_option(version("two")).unwrap();
        server.set_option(addr("127.0.0.1:2022")).unwrap();
        server.set_option(no_pty()).unwrap();
        server
            .set_option(subsystem("sftp", |_session| async {}))
            .unwrap();
        server
            .set_option(idle_timeout(Duration::from_secs(30)))
            .unwrap();
    }
}
