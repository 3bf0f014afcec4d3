use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ssh_pier::test_utils::{collect_channel, TestClient, TestServer};
use ssh_pier::{options, Error, Server};
use tokio::sync::Notify;
use tokio::time::timeout;

async fn run_test_with_timeout<F, Fut>(test_fn: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    timeout(Duration::from_secs(15), test_fn()).await?
}

#[tokio::test]
async fn shutdown_waits_for_running_sessions() -> Result<()> {
    run_test_with_timeout(|| async {
        let release = Arc::new(Notify::new());
        let handler_release = release.clone();
        let server = Server::new(move |session| {
            let release = handler_release.clone();
            async move {
                release.notified().await;
                let _ = session.write(b"done\n").await;
            }
        });
        server
            .set_option(options::password_auth(|_ctx, p| p == "secret"))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let mut channel = client.open_session().await?;
        channel.request_shell(true).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ts.server.live_connections(), 1);

        // With the session still running, a short deadline must lapse.
        let result = ts.server.shutdown(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
        assert_eq!(ts.server.live_connections(), 1);

        // Release the handler; the session finishes and shutdown drains.
        release.notify_waiters();
        let (stdout, _, exit) = collect_channel(&mut channel, Duration::from_secs(5)).await;
        assert_eq!(stdout, b"done\n");
        assert_eq!(exit, Some(0));
        drop(channel);
        let _ = client
            .handle
            .disconnect(russh::Disconnect::ByApplication, "bye", "en")
            .await;

        ts.server.shutdown(Some(Duration::from_secs(10))).await?;
        assert_eq!(ts.server.live_connections(), 0);

        // The accept loop observed the close signal.
        let serve_result = ts.serve_handle.await?;
        assert!(matches!(serve_result, Err(Error::ServerClosed)));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn close_tears_down_live_connections() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = Server::new(|session| async move {
            // Hold the session open until the connection dies.
            let _ = session.recv().await;
        });
        server
            .set_option(options::password_auth(|_ctx, p| p == "secret"))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let mut channel = client.open_session().await?;
        channel.request_shell(true).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ts.server.live_connections(), 1);

        ts.server.close();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ts.server.live_connections() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "close did not drain connections"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let serve_result = ts.serve_handle.await?;
        assert!(matches!(serve_result, Err(Error::ServerClosed)));
        Ok(())
    })
    .await
}

#[tokio::test]
async fn idle_timeout_cancels_quiet_connections() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = Server::new(|session| async move {
            let _ = session.recv().await;
        });
        server
            .set_option(options::password_auth(|_ctx, p| p == "secret"))
            .unwrap();
        server
            .set_option(options::idle_timeout(Duration::from_millis(200)))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let _channel = client.open_session().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ts.server.live_connections(), 1);

        // Go quiet; the deadline watchdog must reap the connection.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ts.server.live_connections() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "idle connection was never reaped"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn max_timeout_bounds_connection_lifetime() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = Server::new(|session| async move {
            // Stay chatty so the idle clock never fires; only the absolute
            // deadline can end this connection.
            loop {
                if session.write(b"tick\n").await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        server
            .set_option(options::password_auth(|_ctx, p| p == "secret"))
            .unwrap();
        server
            .set_option(options::max_timeout(Duration::from_millis(400)))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let mut channel = client.open_session().await?;
        channel.request_shell(true).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ts.server.live_connections() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "absolute deadline never fired"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        ts.server.close();
        Ok(())
    })
    .await
}
