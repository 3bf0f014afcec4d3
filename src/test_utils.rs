//! Shared scaffolding for integration tests: a server harness bound to an
//! ephemeral port and a small russh-based client driver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use russh::client;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;

use crate::{Result, Server};

static INIT_LOGGING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_level(true)
        .try_init();
});

pub fn init_logging() {
    Lazy::force(&INIT_LOGGING);
}

pub fn find_free_port() -> std::io::Result<u16> {
    Ok(std::net::TcpListener::bind("127.0.0.1:0")?
        .local_addr()?
        .port())
}

/// A server under test, bound to an ephemeral loopback port.
pub struct TestServer {
    pub server: Server,
    pub addr: SocketAddr,
    pub serve_handle: tokio::task::JoinHandle<Result<()>>,
}

impl TestServer {
    /// Starts `server` on `127.0.0.1:0`. Options must already be applied.
    pub async fn start(server: Server) -> TestServer {
        init_logging();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let serve_server = server.clone();
        let serve_handle = tokio::spawn(async move { serve_server.serve(listener).await });
        // Give the accept loop a beat to come up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        TestServer {
            server,
            addr,
            serve_handle,
        }
    }
}

/// Channels opened towards the test client by the server (reverse
/// forwarding).
pub type ForwardedChannelRx = mpsc::UnboundedReceiver<(Channel<client::Msg>, String, u32)>;

pub struct TestClientHandler {
    forwarded_tx: mpsc::UnboundedSender<(Channel<client::Msg>, String, u32)>,
}

impl client::Handler for TestClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let _ = self
            .forwarded_tx
            .send((channel, connected_address.to_string(), connected_port));
        Ok(())
    }
}

/// Minimal SSH client for driving a [`TestServer`].
pub struct TestClient {
    pub handle: client::Handle<TestClientHandler>,
    pub forwarded: ForwardedChannelRx,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let config = Arc::new(client::Config::default());
        let (forwarded_tx, forwarded) = mpsc::unbounded_channel();
        let handler = TestClientHandler { forwarded_tx };
        let handle = client::connect(config, addr, handler).await?;
        Ok(TestClient { handle, forwarded })
    }

    /// Connects and authenticates with a password.
    pub async fn with_password(
        addr: SocketAddr,
        user: &str,
        password: &str,
    ) -> anyhow::Result<Self> {
        let mut client = Self::connect(addr).await?;
        let outcome = client.handle.authenticate_password(user, password).await?;
        if !outcome.success() {
            anyhow::bail!("unable to authenticate");
        }
        Ok(client)
    }

    /// Connects and authenticates with a private key.
    pub async fn with_key(addr: SocketAddr, user: &str, key: PrivateKey) -> anyhow::Result<Self> {
        let mut client = Self::connect(addr).await?;
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        let outcome = client.handle.authenticate_publickey(user, key).await?;
        if !outcome.success() {
            anyhow::bail!("unable to authenticate");
        }
        Ok(client)
    }

    /// Connects with no authentication method.
    pub async fn without_auth(addr: SocketAddr, user: &str) -> anyhow::Result<Self> {
        let mut client = Self::connect(addr).await?;
        let outcome = client.handle.authenticate_none(user).await?;
        if !outcome.success() {
            anyhow::bail!("unable to authenticate");
        }
        Ok(client)
    }

    pub async fn open_session(&self) -> anyhow::Result<Channel<client::Msg>> {
        Ok(self.handle.channel_open_session().await?)
    }
}

/// Collects channel output until EOF/close or the timeout elapses.
/// Returns `(stdout, stderr, exit_status)`.
pub async fn collect_channel(
    channel: &mut Channel<client::Msg>,
    timeout: Duration,
) -> (Vec<u8>, Vec<u8>, Option<u32>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let msg = tokio::select! {
            msg = channel.wait() => msg,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        match msg {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = Some(code),
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
    (stdout, stderr, exit_status)
}

/// A blocking echo server on its own thread, for forwarding tests.
pub fn start_echo_server(port: u16) {
    use std::io::{Read, Write};
    let listener = std::net::TcpListener::bind(format!("127.0.0.1:{}", port)).unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            if let Ok(mut stream) = stream {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                                if stream.flush().is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                });
            }
        }
    });
}
