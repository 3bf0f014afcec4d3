//! SSH agent forwarding.
//!
//! A client that wants its agent available on the server sends
//! `auth-agent-req@openssh.com` on the session channel; the framework
//! marks the connection context. A handler can then stand up a local
//! listener and bridge every accepted connection back to the client's
//! agent over `auth-agent@openssh.com` channels.

use tokio::net::UnixListener;
use tracing::{debug, error};

use crate::error::Result;
use crate::session::Session;
use crate::utils::bridge;

pub const AGENT_REQUEST_TYPE: &str = "auth-agent-req@openssh.com";
pub const AGENT_CHANNEL_TYPE: &str = "auth-agent@openssh.com";

/// True once the session's client has asked for agent forwarding.
pub fn agent_requested(session: &Session) -> bool {
    session.context().agent_requested()
}

/// A temporary Unix socket for the forwarded agent. The socket lives in a
/// private temp directory and disappears with this value.
pub struct AgentListener {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
    listener: UnixListener,
}

impl AgentListener {
    /// Path handlers export as `SSH_AUTH_SOCK` for child processes.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Creates the local listener for a forwarded agent.
pub fn new_agent_listener() -> Result<AgentListener> {
    let dir = tempfile::Builder::new().prefix("auth-agent").tempdir()?;
    let path = dir.path().join("listener.sock");
    let listener = UnixListener::bind(&path)?;
    Ok(AgentListener {
        _dir: dir,
        path,
        listener,
    })
}

/// Accepts connections on the agent listener and tunnels each through a
/// new `auth-agent@openssh.com` channel to the client. Runs until the
/// listener fails or the session's connection ends.
pub async fn forward_agent_connections(listener: &AgentListener, session: &Session) {
    let ctx = session.context().clone();
    loop {
        let conn = tokio::select! {
            accepted = listener.listener.accept() => match accepted {
                Ok((conn, _addr)) => conn,
                Err(e) => {
                    error!(error = %e, "agent listener accept failed");
                    return;
                }
            },
            _ = ctx.cancelled() => return,
        };

        let handle = session.handle();
        let cancel = ctx.cancellation_token();
        tokio::spawn(async move {
            let channel = match handle.channel_open_agent().await {
                Ok(c) => c,
                Err(e) => {
                    error!(error = ?e, "auth-agent channel open failed");
                    return;
                }
            };
            debug!("agent connection bridged");
            tokio::select! {
                _ = bridge(channel.into_stream(), conn, "auth-agent") => {}
                _ = cancel.cancelled() => {}
            }
        });
    }
}
