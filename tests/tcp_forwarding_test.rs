use std::time::Duration;

use anyhow::Result;
use ssh_pier::test_utils::{find_free_port, start_echo_server, TestClient, TestServer};
use ssh_pier::{options, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn run_test_with_timeout<F, Fut>(test_fn: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    timeout(Duration::from_secs(15), test_fn()).await?
}

fn forwarding_server() -> Server {
    let server = Server::new(|_session| async {});
    server
        .set_option(options::password_auth(|_ctx, password| password == "secret"))
        .unwrap();
    server
}

#[tokio::test]
async fn direct_tcpip_reaches_an_echo_server() -> Result<()> {
    run_test_with_timeout(|| async {
        let echo_port = find_free_port()?;
        start_echo_server(echo_port);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let server = forwarding_server();
        server
            .set_option(options::local_port_forwarding(|_ctx, host, port| {
                host == "127.0.0.1" && port > 0
            }))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let mut channel = client
            .handle
            .channel_open_direct_tcpip("127.0.0.1", echo_port as u32, "127.0.0.1", 39999)
            .await?;

        channel.data(&b"ping"[..]).await?;
        let mut received = Vec::new();
        while received.len() < 4 {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => received.extend_from_slice(&data),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(received, b"ping");

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn direct_tcpip_is_denied_without_a_callback() -> Result<()> {
    run_test_with_timeout(|| async {
        let echo_port = find_free_port()?;
        start_echo_server(echo_port);

        let ts = TestServer::start(forwarding_server()).await;
        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;

        let attempt = client
            .handle
            .channel_open_direct_tcpip("127.0.0.1", echo_port as u32, "127.0.0.1", 39999)
            .await;
        assert!(attempt.is_err(), "forwarding must be denied by default");

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn reverse_forward_tunnels_inbound_connections() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = forwarding_server();
        server
            .set_option(options::reverse_port_forwarding(|_ctx, host, _port| {
                host == "127.0.0.1"
            }))
            .unwrap();
        let ts = TestServer::start(server).await;

        let mut client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let forward_port = find_free_port()?;
        let _ = client
            .handle
            .tcpip_forward("127.0.0.1", forward_port as u32)
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Bridge channels the server opens towards the client into an echo.
        let bridge_task = tokio::spawn(async move {
            while let Some((channel, _addr, _port)) = client.forwarded.recv().await {
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
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
            client
        });

        // An external client connecting to the server-side port gets its
        // bytes tunneled to the SSH client and back.
        let mut external = TcpStream::connect(("127.0.0.1", forward_port)).await?;
        external.write_all(b"over the wall").await?;
        external.flush().await?;
        let mut reply = [0u8; 13];
        external.read_exact(&mut reply).await?;
        assert_eq!(&reply, b"over the wall");
        drop(external);

        // Once the SSH connection ends, the listener must die with it.
        bridge_task.abort();
        ts.server.close();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", forward_port)).await {
                Err(_) => break,
                Ok(_) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "listener survived the connection"
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        Ok(())
    })
    .await
}

#[tokio::test]
async fn reverse_forward_is_denied_without_a_callback() -> Result<()> {
    run_test_with_timeout(|| async {
        let ts = TestServer::start(forwarding_server()).await;
        let mut client = TestClient::with_password(ts.addr, "alice", "secret").await?;

        let forward_port = find_free_port()?;
        let result = client
            .handle
            .tcpip_forward("127.0.0.1", forward_port as u32)
            .await;
        // Either the call errors or the port never starts listening.
        if result.is_ok() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(
                TcpStream::connect(("127.0.0.1", forward_port)).await.is_err(),
                "denied forward must not listen"
            );
        }

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn cancel_tcpip_forward_closes_the_listener() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = forwarding_server();
        server
            .set_option(options::reverse_port_forwarding(|_ctx, _host, _port| true))
            .unwrap();
        let ts = TestServer::start(server).await;

        let mut client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let forward_port = find_free_port()?;
        let _ = client
            .handle
            .tcpip_forward("127.0.0.1", forward_port as u32)
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(TcpStream::connect(("127.0.0.1", forward_port)).await.is_ok());

        let _ = client
            .handle
            .cancel_tcpip_forward("127.0.0.1", forward_port as u32)
            .await?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect(("127.0.0.1", forward_port)).await {
                Err(_) => break,
                Ok(_) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "cancelled listener still accepting"
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        ts.server.close();
        Ok(())
    })
    .await
}
