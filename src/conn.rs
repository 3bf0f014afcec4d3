//! Per-connection transport adapter: implements the transport library's
//! server `Handler`, demultiplexing auth callbacks, channel opens, session
//! requests, and global forwarding requests onto the framework surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use russh::server::{Auth, Msg, Session as TransportSession};
use russh::{Channel, ChannelId, MethodSet};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::context::Context;
use crate::pty::{Pty, PtyMode, TerminalModes, Window};
use crate::session::{Invocation, Session, SessionState};
use crate::tcpip::ForwardedTcpHandler;
use crate::Error;
use crate::{ServerConfig, SessionHandler};

#[cfg(unix)]
use crate::streamlocal::ForwardedUnixHandler;

/// One `ConnHandler` exists per connection; the transport calls it for
/// every auth attempt, channel open, and request.
pub(crate) struct ConnHandler {
    cfg: Arc<ServerConfig>,
    ctx: Context,
    sessions: Arc<Mutex<HashMap<ChannelId, SessionEntry>>>,
    tcp_forwards: Arc<ForwardedTcpHandler>,
    #[cfg(unix)]
    unix_forwards: Arc<ForwardedUnixHandler>,
}

struct SessionEntry {
    session: Session,
    input_tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ConnHandler {
    pub(crate) fn new(cfg: Arc<ServerConfig>, ctx: Context) -> Self {
        ConnHandler {
            cfg,
            ctx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tcp_forwards: Arc::new(ForwardedTcpHandler::new()),
            #[cfg(unix)]
            unix_forwards: Arc::new(ForwardedUnixHandler::new()),
        }
    }

    /// Auth methods this server is prepared to evaluate, for rejection
    /// replies steering the client.
    fn offered_methods(&self) -> Option<MethodSet> {
        self.cfg.auth_methods()
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: self.offered_methods(),
            partial_success: false,
        }
    }

    fn channel_open_permitted(&self, channel_type: &str) -> bool {
        match &self.cfg.channel_open_callback {
            Some(cb) => cb(&self.ctx, channel_type),
            None => true,
        }
    }

    fn session_request_vetoed(&self, session: &Session, request_type: &str) -> bool {
        match &self.cfg.session_request_callback {
            Some(cb) => !cb(session, request_type),
            None => false,
        }
    }

    fn with_session<R>(
        &self,
        channel: ChannelId,
        f: impl FnOnce(&mut SessionEntry) -> R,
    ) -> Option<R> {
        self.sessions.lock().unwrap().get_mut(&channel).map(f)
    }

    /// Replies success and runs the chosen handler for an accepted
    /// `shell`/`exec`/`subsystem` request. The success reply goes on the
    /// wire before the handler observes the session.
    fn accept_invocation(
        &self,
        invocation: Invocation,
        session: Session,
        transport: &mut TransportSession,
    ) -> Result<(), Error> {
        let handler: SessionHandler = match &invocation {
            Invocation::Handler => self.cfg.handler.clone(),
            Invocation::Subsystem(name) => match self.cfg.subsystem_handlers.get(name) {
                Some(h) => h.clone(),
                None => {
                    transport.channel_failure(session.channel_id())?;
                    return Ok(());
                }
            },
            Invocation::Refused => {
                transport.channel_failure(session.channel_id())?;
                return Ok(());
            }
        };
        transport.channel_success(session.channel_id())?;
        let fut = handler(session.clone());
        tokio::spawn(session.drive(fut));
        Ok(())
    }
}

impl russh::server::Handler for ConnHandler {
    type Error = Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(self.cfg.banner.clone())
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.ctx.set_user(user);
        if self.offered_methods().is_none() {
            // No authentication callbacks configured: admit everyone.
            debug!(user, "no auth configured, accepting");
            return Ok(Auth::Accept);
        }
        Ok(self.reject())
    }

    #[instrument(skip(self, password), fields(conn = self.ctx.session_id(), user = %user))]
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.ctx.set_user(user);
        if let Some(handler) = &self.cfg.password_handler {
            if handler(&self.ctx, password) {
                info!("password auth accepted");
                return Ok(Auth::Accept);
            }
            info!("password auth rejected");
            return Ok(self.reject());
        }
        if let Some(handler) = &self.cfg.password_handler_explicit {
            return match handler(&self.ctx, password) {
                Ok(()) => Ok(Auth::Accept),
                Err(Error::PermissionDenied { partial_success }) => Ok(Auth::Reject {
                    proceed_with_methods: self.offered_methods(),
                    partial_success,
                }),
                Err(e) => {
                    warn!(error = %e, "password auth callback failed");
                    Ok(self.reject())
                }
            };
        }
        Ok(self.reject())
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.ctx.set_user(user);
        match &self.cfg.public_key_handler {
            Some(handler) if handler(&self.ctx, public_key) => Ok(Auth::Accept),
            _ => Ok(self.reject()),
        }
    }

    #[instrument(skip(self, public_key), fields(conn = self.ctx.session_id(), user = %user))]
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.ctx.set_user(user);
        match &self.cfg.public_key_handler {
            Some(handler) if handler(&self.ctx, public_key) => {
                self.ctx.set_public_key(public_key.clone());
                info!("public key auth accepted");
                Ok(Auth::Accept)
            }
            Some(_) => {
                info!("public key auth rejected");
                Ok(self.reject())
            }
            None => Ok(self.reject()),
        }
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        submethods: &str,
        response: Option<russh::server::Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        self.ctx.set_user(user);
        let Some(handler) = &self.cfg.keyboard_interactive_handler else {
            return Ok(self.reject());
        };
        let answers = response.map(|r| {
            r.into_iter()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .collect::<Vec<_>>()
        });
        match handler(&self.ctx, submethods, answers) {
            crate::auth::InteractiveDecision::Accept => Ok(Auth::Accept),
            crate::auth::InteractiveDecision::Reject => Ok(self.reject()),
            crate::auth::InteractiveDecision::Challenge {
                name,
                instruction,
                prompts,
            } => Ok(Auth::Partial {
                name: name.into(),
                instructions: instruction.into(),
                prompts: prompts
                    .into_iter()
                    .map(|(text, echo)| (std::borrow::Cow::Owned(text), echo))
                    .collect::<Vec<_>>()
                    .into(),
            }),
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut TransportSession) -> Result<(), Self::Error> {
        info!(
            conn = self.ctx.session_id(),
            user = %self.ctx.user(),
            "authenticated"
        );
        Ok(())
    }

    #[instrument(skip(self, channel, transport), fields(conn = self.ctx.session_id(), channel = ?channel.id()))]
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        if !self.channel_open_permitted("session") {
            debug!("session channel refused by callback");
            return Ok(false);
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let session = Session::new(
            self.ctx.clone(),
            channel.id(),
            transport.handle(),
            SessionState::default(),
            input_rx,
        );
        self.sessions.lock().unwrap().insert(
            channel.id(),
            SessionEntry {
                session,
                input_tx: Some(input_tx),
            },
        );
        trace!("session channel opened");
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let accepted = self
            .with_session(channel, |entry| {
                entry
                    .session
                    .with_state(|s| s.on_env(variable_name, variable_value))
            })
            .unwrap_or(false);
        if accepted {
            transport.channel_success(channel)?;
        } else {
            transport.channel_failure(channel)?;
        }
        Ok(())
    }

    #[instrument(skip(self, modes, transport), fields(conn = self.ctx.session_id(), channel = ?channel, term = %term))]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(russh::Pty, u32)],
        transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let pty = Pty {
            term: term.to_string(),
            window: Window {
                cols: col_width,
                rows: row_height,
                pixel_width: pix_width,
                pixel_height: pix_height,
            },
            modes: TerminalModes::from_transport(modes),
        };

        let permitted = match &self.cfg.pty_callback {
            Some(cb) => cb(&self.ctx, &pty),
            None => true,
        };
        if !permitted || col_width == 0 || row_height == 0 {
            debug!("pty request refused");
            transport.channel_failure(channel)?;
            return Ok(());
        }

        #[cfg(unix)]
        let allocation = if self.cfg.pty_mode == PtyMode::Allocated {
            match crate::pty::PtyAllocation::open(pty.window, &pty.modes) {
                Ok(a) => Some(a),
                Err(e) => {
                    warn!(error = %e, "pty allocation failed");
                    transport.channel_failure(channel)?;
                    return Ok(());
                }
            }
        } else {
            None
        };
        #[cfg(not(unix))]
        if self.cfg.pty_mode == PtyMode::Allocated {
            warn!("pty allocation unsupported on this platform");
            transport.channel_failure(channel)?;
            return Ok(());
        }

        let accepted = self
            .with_session(channel, |entry| {
                entry.session.with_state(|s| {
                    let ok = s.on_pty_request(pty.clone());
                    #[cfg(unix)]
                    if ok {
                        if let Some(alloc) = allocation {
                            s.set_allocation(alloc);
                        }
                    }
                    ok
                })
            })
            .unwrap_or(false);
        if accepted {
            transport.channel_success(channel)?;
        } else {
            transport.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let window = Window {
            cols: col_width,
            rows: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        };
        let accepted = col_width > 0
            && row_height > 0
            && self
                .with_session(channel, |entry| {
                    entry.session.with_state(|s| s.on_window_change(window))
                })
                .unwrap_or(false);
        if accepted {
            transport.channel_success(channel)?;
        } else {
            trace!(channel = ?channel, "window-change without pty ignored");
            transport.channel_failure(channel)?;
        }
        Ok(())
    }

    #[instrument(skip(self, transport), fields(conn = self.ctx.session_id(), channel = ?channel))]
    async fn shell_request(
        &mut self,
        channel: ChannelId,
        transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let Some((invocation, session)) = self.with_session(channel, |entry| {
            let vetoed = {
                let session = entry.session.clone();
                self.session_request_vetoed(&session, "shell")
            };
            let invocation = entry.session.with_state(|s| s.on_shell(vetoed));
            (invocation, entry.session.clone())
        }) else {
            transport.channel_failure(channel)?;
            return Ok(());
        };
        self.accept_invocation(invocation, session, transport)
    }

    #[instrument(skip(self, data, transport), fields(conn = self.ctx.session_id(), channel = ?channel))]
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        debug!(command = %raw, "exec request");
        let Some((invocation, session)) = self.with_session(channel, |entry| {
            let vetoed = {
                let session = entry.session.clone();
                self.session_request_vetoed(&session, "exec")
            };
            let invocation = entry.session.with_state(|s| s.on_exec(&raw, vetoed));
            (invocation, entry.session.clone())
        }) else {
            transport.channel_failure(channel)?;
            return Ok(());
        };
        self.accept_invocation(invocation, session, transport)
    }

    #[instrument(skip(self, transport), fields(conn = self.ctx.session_id(), channel = ?channel, name = %name))]
    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        let registered = self.cfg.subsystem_handlers.contains_key(name);
        let Some((invocation, session)) = self.with_session(channel, |entry| {
            let vetoed = {
                let session = entry.session.clone();
                self.session_request_vetoed(&session, "subsystem")
            };
            let invocation = entry
                .session
                .with_state(|s| s.on_subsystem(name, registered, vetoed));
            (invocation, entry.session.clone())
        }) else {
            transport.channel_failure(channel)?;
            return Ok(());
        };
        self.accept_invocation(invocation, session, transport)
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal_name: russh::Sig,
        _transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        self.with_session(channel, |entry| {
            entry
                .session
                .with_state(|s| s.on_signal(signal_name.into()))
        });
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel, "agent forwarding requested");
        self.ctx.set_agent_requested();
        transport.channel_success(channel)?;
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        self.with_session(channel, |entry| {
            if let Some(tx) = &entry.input_tx {
                if tx.send(Bytes::copy_from_slice(data)).is_err() {
                    entry.input_tx = None;
                }
            }
        });
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        // Dropping the sender gives the session reader EOF.
        self.with_session(channel, |entry| entry.input_tx = None);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _transport: &mut TransportSession,
    ) -> Result<(), Self::Error> {
        trace!(channel = ?channel, "channel closed");
        self.sessions.lock().unwrap().remove(&channel);
        Ok(())
    }

    #[instrument(skip(self, channel, _transport), fields(conn = self.ctx.session_id(), dest = %format!("{}:{}", host_to_connect, port_to_connect)))]
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        if !self.channel_open_permitted("direct-tcpip") {
            return Ok(false);
        }
        let permitted = match &self.cfg.local_port_forwarding_callback {
            Some(cb) => cb(&self.ctx, host_to_connect, port_to_connect),
            None => false,
        };
        if !permitted {
            info!("direct-tcpip prohibited");
            return Ok(false);
        }
        Ok(crate::tcpip::handle_direct_tcpip(
            &self.ctx,
            channel,
            host_to_connect,
            port_to_connect,
            originator_address,
            originator_port,
        )
        .await)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        let permitted = match &self.cfg.reverse_port_forwarding_callback {
            Some(cb) => cb(&self.ctx, address, *port),
            None => false,
        };
        if !permitted {
            info!(address, port = *port, "tcpip-forward prohibited");
            return Ok(false);
        }
        Ok(self
            .tcp_forwards
            .clone()
            .tcpip_forward(&self.ctx, transport.handle(), address, port)
            .await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        Ok(self.tcp_forwards.cancel_tcpip_forward(address, port).await)
    }

    #[cfg(unix)]
    #[instrument(skip(self, channel, _transport), fields(conn = self.ctx.session_id(), socket_path = %socket_path))]
    async fn channel_open_direct_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        if !self.channel_open_permitted("direct-streamlocal@openssh.com") {
            return Ok(false);
        }
        let permitted = match &self.cfg.local_unix_forwarding_callback {
            Some(cb) => cb(&self.ctx, socket_path),
            None => false,
        };
        if !permitted {
            info!("direct-streamlocal prohibited");
            return Ok(false);
        }
        Ok(crate::streamlocal::handle_direct_streamlocal(&self.ctx, channel, socket_path).await)
    }

    #[cfg(unix)]
    async fn streamlocal_forward(
        &mut self,
        socket_path: &str,
        transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        let Some(cb) = &self.cfg.reverse_unix_forwarding_callback else {
            info!(socket_path, "streamlocal-forward prohibited");
            return Ok(false);
        };
        let listener = match cb(&self.ctx, socket_path) {
            Ok(l) => l,
            Err(Error::Rejected) => {
                info!(socket_path, "streamlocal-forward rejected by callback");
                return Ok(false);
            }
            Err(e) => {
                warn!(socket_path, error = %e, "reverse unix callback failed");
                return Ok(false);
            }
        };
        Ok(self
            .unix_forwards
            .clone()
            .streamlocal_forward(&self.ctx, transport.handle(), socket_path, listener)
            .await)
    }

    #[cfg(unix)]
    async fn cancel_streamlocal_forward(
        &mut self,
        socket_path: &str,
        _transport: &mut TransportSession,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .unix_forwards
            .cancel_streamlocal_forward(socket_path)
            .await)
    }
}

impl Drop for ConnHandler {
    fn drop(&mut self) {
        // The connection is gone: release forward listeners promptly even
        // if the cancellation token has not fired yet.
        let tcp = self.tcp_forwards.clone();
        #[cfg(unix)]
        let unix = self.unix_forwards.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                tcp.close_all().await;
                #[cfg(unix)]
                unix.close_all().await;
            });
        }
    }
}
