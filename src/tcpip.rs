//! TCP forwarding: client-initiated `direct-tcpip` channels and
//! server-listening `tcpip-forward` (reverse) forwards.

use std::collections::HashMap;
use std::sync::Arc;

use russh::server::Msg;
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::utils::bridge;

/// Gate for `direct-tcpip`: `(context, destination host, destination
/// port)`. Denied when unset.
pub type LocalPortForwardingCallback = Arc<dyn Fn(&Context, &str, u32) -> bool + Send + Sync>;

/// Gate for `tcpip-forward`: `(context, bind host, bind port)`. Denied
/// when unset.
pub type ReversePortForwardingCallback = Arc<dyn Fn(&Context, &str, u32) -> bool + Send + Sync>;

/// Dials the destination of an accepted `direct-tcpip` channel and bridges
/// it. The permission check has already happened; a dial failure rejects
/// the channel.
pub(crate) async fn handle_direct_tcpip(
    ctx: &Context,
    channel: Channel<Msg>,
    host: &str,
    port: u32,
    origin_host: &str,
    origin_port: u32,
) -> bool {
    let dest = format!("{}:{}", host, port);
    debug!(%dest, origin = %format!("{}:{}", origin_host, origin_port), "direct-tcpip open");

    // The dial is bounded by the connection's lifetime.
    let stream = tokio::select! {
        r = TcpStream::connect(&dest) => r,
        _ = ctx.cancelled() => return false,
    };
    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            error!(%dest, error = %e, "direct-tcpip dial failed");
            return false;
        }
    };

    let cancel = ctx.cancellation_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = bridge(channel.into_stream(), stream, "direct-tcpip") => {}
            _ = cancel.cancelled() => {}
        }
    });
    true
}

/// Per-connection registry of reverse TCP forwards.
///
/// Entries are added by `tcpip-forward`, removed by `cancel-tcpip-forward`
/// or when the connection context is cancelled; a listener never outlives
/// its connection.
pub(crate) struct ForwardedTcpHandler {
    forwards: Mutex<HashMap<(String, u32), mpsc::UnboundedSender<()>>>,
}

impl ForwardedTcpHandler {
    pub(crate) fn new() -> Self {
        ForwardedTcpHandler {
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// Services `tcpip-forward`: binds the requested address (an ephemeral
    /// port when `*port == 0`, reported back through `port`), registers
    /// the listener, and spawns its accept loop.
    pub(crate) async fn tcpip_forward(
        self: Arc<Self>,
        ctx: &Context,
        handle: russh::server::Handle,
        address: &str,
        port: &mut u32,
    ) -> bool {
        let bind_addr = format!("{}:{}", address, *port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(%bind_addr, error = %e, "reverse forward bind failed");
                return false;
            }
        };
        let actual_port = match listener.local_addr() {
            Ok(addr) => addr.port() as u32,
            Err(e) => {
                error!(error = %e, "reverse forward local_addr failed");
                return false;
            }
        };

        let key = (address.to_string(), actual_port);
        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
        {
            let mut forwards = self.forwards.lock().await;
            if forwards.contains_key(&key) {
                warn!(address, port = actual_port, "duplicate reverse forward");
                return false;
            }
            forwards.insert(key.clone(), shutdown_tx);
        }
        info!(address, port = actual_port, "reverse forward listening");

        let bind_host = address.to_string();
        let cancel = ctx.cancellation_token();
        let conn = ctx.session_id();
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let handle = handle.clone();
                                let bind_host = bind_host.clone();
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    let channel = match handle
                                        .channel_open_forwarded_tcpip(
                                            &bind_host,
                                            actual_port,
                                            &peer.ip().to_string(),
                                            peer.port() as u32,
                                        )
                                        .await
                                    {
                                        Ok(c) => c,
                                        Err(e) => {
                                            error!(error = ?e, "forwarded-tcpip open failed");
                                            return;
                                        }
                                    };
                                    tokio::select! {
                                        _ = bridge(channel.into_stream(), stream, "forwarded-tcpip") => {}
                                        _ = cancel.cancelled() => {}
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "reverse forward accept failed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!(conn, %bind_host, port = actual_port, "reverse forward cancelled");
                        break;
                    }
                    _ = cancel.cancelled() => {
                        debug!(conn, %bind_host, port = actual_port, "connection ended, closing reverse forward");
                        break;
                    }
                }
            }
            registry.forwards.lock().await.remove(&key);
        });

        *port = actual_port;
        true
    }

    /// Services `cancel-tcpip-forward`.
    pub(crate) async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> bool {
        let mut forwards = self.forwards.lock().await;
        match forwards.remove(&(address.to_string(), port)) {
            Some(shutdown_tx) => {
                let _ = shutdown_tx.send(());
                info!(address, port, "reverse forward removed");
                true
            }
            None => {
                warn!(address, port, "no reverse forward to cancel");
                false
            }
        }
    }

    /// Drops every registered forward; used when the connection ends.
    pub(crate) async fn close_all(&self) {
        let mut forwards = self.forwards.lock().await;
        for ((address, port), shutdown_tx) in forwards.drain() {
            debug!(%address, port, "closing reverse forward");
            let _ = shutdown_tx.send(());
        }
    }
}
