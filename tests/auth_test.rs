use std::time::Duration;

use anyhow::Result;
use ssh_pier::test_utils::{collect_channel, TestClient, TestServer};
use ssh_pier::{keys_equal, options, InteractiveDecision, Server};
use tokio::time::timeout;

async fn run_test_with_timeout<F, Fut>(test_fn: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    timeout(Duration::from_secs(15), test_fn()).await?
}

async fn wait_for_no_connections(server: &Server) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.live_connections() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "connections never drained"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn rejected_password_fails_and_drains() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = Server::new(|_session| async {});
        server
            .set_option(options::password_auth(|_ctx, password| password == "right"))
            .unwrap();
        let ts = TestServer::start(server).await;

        let attempt = TestClient::with_password(ts.addr, "mallory", "bad").await;
        assert!(attempt.is_err(), "bad password must not authenticate");

        wait_for_no_connections(&ts.server).await;
        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn password_callback_sees_user_and_context() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = Server::new(|session| async move {
            let _ = session.write(session.user().as_bytes()).await;
        });
        server
            .set_option(options::password_auth(|ctx, password| {
                ctx.user() == "alice" && password == "secret"
            }))
            .unwrap();
        let ts = TestServer::start(server).await;

        assert!(TestClient::with_password(ts.addr, "bob", "secret")
            .await
            .is_err());

        let client = TestClient::with_password(ts.addr, "alice", "secret").await?;
        let mut channel = client.open_session().await?;
        channel.request_shell(true).await?;
        let (stdout, _, _) = collect_channel(&mut channel, Duration::from_secs(5)).await;
        assert_eq!(stdout, b"alice");

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn public_key_auth_exposes_the_key_to_handlers() -> Result<()> {
    run_test_with_timeout(|| async {
        let client_key = ssh_pier::auth::generate_host_key()?;
        let authorized = client_key.public_key().clone();

        let expected = authorized.clone();
        let server = Server::new(move |session| {
            let expected = expected.clone();
            async move {
                let key = session.public_key().expect("session has a public key");
                let matches = keys_equal(&key, &expected);
                let _ = session
                    .write(if matches { b"key-match" } else { b"key-mismatch" })
                    .await;
            }
        });
        server
            .set_option(options::public_key_auth(move |_ctx, offered| {
                keys_equal(offered, &authorized)
            }))
            .unwrap();
        let ts = TestServer::start(server).await;

        let client = TestClient::with_key(ts.addr, "alice", client_key).await?;
        let mut channel = client.open_session().await?;
        channel.request_shell(true).await?;
        let (stdout, _, exit) = collect_channel(&mut channel, Duration::from_secs(5)).await;
        assert_eq!(stdout, b"key-match");
        assert_eq!(exit, Some(0));

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn unknown_public_key_is_rejected() -> Result<()> {
    run_test_with_timeout(|| async {
        let authorized = ssh_pier::auth::generate_host_key()?.public_key().clone();
        let server = Server::new(|_session| async {});
        server
            .set_option(options::public_key_auth(move |_ctx, offered| {
                keys_equal(offered, &authorized)
            }))
            .unwrap();
        let ts = TestServer::start(server).await;

        let other_key = ssh_pier::auth::generate_host_key()?;
        assert!(TestClient::with_key(ts.addr, "alice", other_key)
            .await
            .is_err());

        wait_for_no_connections(&ts.server).await;
        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn no_auth_callbacks_admits_anyone() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = Server::new(|session| async move {
            let _ = session.write(b"welcome").await;
        });
        let ts = TestServer::start(server).await;

        let client = TestClient::without_auth(ts.addr, "guest").await?;
        let mut channel = client.open_session().await?;
        channel.request_shell(true).await?;
        let (stdout, _, _) = collect_channel(&mut channel, Duration::from_secs(5)).await;
        assert_eq!(stdout, b"welcome");

        ts.server.close();
        Ok(())
    })
    .await
}

#[tokio::test]
async fn keyboard_interactive_round_trip() -> Result<()> {
    run_test_with_timeout(|| async {
        let server = Server::new(|session| async move {
            let _ = session.write(b"in").await;
        });
        server
            .set_option(options::keyboard_interactive_auth(
                |_ctx, _submethods, answers| match answers {
                    None => InteractiveDecision::Challenge {
                        name: "login".into(),
                        instruction: "prove yourself".into(),
                        prompts: vec![("passphrase: ".into(), false)],
                    },
                    Some(answers) if answers.first().map(String::as_str) == Some("sesame") => {
                        InteractiveDecision::Accept
                    }
                    Some(_) => InteractiveDecision::Reject,
                },
            ))
            .unwrap();
        let ts = TestServer::start(server).await;

        let config = std::sync::Arc::new(russh::client::Config::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = AcceptingClient { _tx: tx };
        let mut handle = russh::client::connect(config, ts.addr, handler).await?;

        let response = handle
            .authenticate_keyboard_interactive_start("alice", None)
            .await?;
        let russh::client::KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } = response
        else {
            anyhow::bail!("expected a challenge, got {:?}", response);
        };
        assert_eq!(prompts.len(), 1);

        let response = handle
            .authenticate_keyboard_interactive_respond(vec!["sesame".to_string()])
            .await?;
        assert!(matches!(
            response,
            russh::client::KeyboardInteractiveAuthResponse::Success
        ));

        ts.server.close();
        Ok(())
    })
    .await
}

struct AcceptingClient {
    _tx: tokio::sync::mpsc::UnboundedSender<()>,
}

impl russh::client::Handler for AcceptingClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}
