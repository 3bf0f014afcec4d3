#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use ssh_pier::test_utils::{TestClient, TestServer};
use ssh_pier::{options, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::time::timeout;

async fn run_test_with_timeout<F, Fut>(test_fn: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    timeout(Duration::from_secs(15), test_fn()).await?
}

fn start_unix_echo(listener: UnixListener) {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn direct_streamlocal_reaches_a_unix_echo() -> Result<()> {
    run_test_with_timeout(|| async {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("echo.sock");
        start_unix_echo(UnixListener::bind(&socket_path)?);

        let server = Server::new(|_session| async {});
        server
            .set_option(options::password_auth(|_ctx, p| p == "secret"))
            .unwrap();
        server
            .set_option(options::local_unix_forwarding(|_ctx, path| {
                path.ends_with("echo.sock")
            }))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let mut channel = client
            .handle
            .channel_open_direct_streamlocal(socket_path.to_str().unwrap())
            .await?;

        channel.data(&b"unix ping"[..]).await?;
        let mut received = Vec::new();
        while received.len() < 9 {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => received.extend_from_slice(&data),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(received, b"unix ping");

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn direct_streamlocal_is_denied_without_a_callback() -> Result<()> {
    run_test_with_timeout(|| async {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("echo.sock");
        start_unix_echo(UnixListener::bind(&socket_path)?);

        let server = Server::new(|_session| async {});
        server
            .set_option(options::password_auth(|_ctx, p| p == "secret"))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let attempt = client
            .handle
            .channel_open_direct_streamlocal(socket_path.to_str().unwrap())
            .await;
        assert!(attempt.is_err());

        ts.server.close();
        Ok(())
    })
    .await
}
