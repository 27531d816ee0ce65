use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use device_gate::auth::{AuthGate, IdentityClient, VerifiedIdentity};
use device_gate::config::GatewayConfig;
use device_gate::server::{load_host_key, Gateway, SessionHandler, SessionIo};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Records every session it is asked to run.
#[derive(Default)]
struct CountingShell {
    invocations: AtomicUsize,
    logins: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionHandler for CountingShell {
    async fn handle(
        &self,
        identity: &VerifiedIdentity,
        mut io: Box<dyn SessionIo>,
    ) -> device_gate::error::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.logins.lock().unwrap().push(identity.login.clone());
        io.write_all(format!("hello {}\r\n", identity.login).as_bytes())
            .await?;
        io.flush().await?;
        Ok(())
    }
}

struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn form(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/x-www-form-urlencoded")
        .set_body_string(body)
}

async fn approving_provider() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/device/code"))
        .respond_with(form(
            "device_code=D&user_code=1234&verification_uri=https%3A%2F%2Fx&expires_in=900&interval=5",
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(form("access_token=T&token_type=bearer&scope=read"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "login": "alice" })))
        .mount(&server)
        .await;
    server
}

/// Start a gateway on an ephemeral port and return its address.
async fn start_gateway(
    provider: &MockServer,
    shell: Arc<CountingShell>,
    max_connections: usize,
) -> (SocketAddr, Arc<Gateway>) {
    let mut config = GatewayConfig::from_lookup(|key| match key {
        "OIDC_CODE_ENDPOINT" => Some(format!("{}/device/code", provider.uri())),
        "OIDC_TOKEN_ENDPOINT" => Some(format!("{}/token", provider.uri())),
        "OIDC_PROFILE_ENDPOINT" => Some(format!("{}/user", provider.uri())),
        "OIDC_CLIENT_ID" => Some("client-1".to_string()),
        _ => None,
    })
    .unwrap();
    config.max_connections = max_connections;
    let host_key = load_host_key(
        &PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/host_ed25519"),
    )
    .unwrap();
    let client = IdentityClient::from_config(&config.provider).unwrap();
    let gate = AuthGate::new(Arc::new(client), config.gate_settings());
    let gateway = Arc::new(Gateway::new(&config, host_key, Arc::new(gate), shell));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = gateway.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (addr, gateway)
}

async fn connect(addr: SocketAddr) -> client::Handle<TrustingClient> {
    client::connect(Arc::new(client::Config::default()), addr, TrustingClient)
        .await
        .unwrap()
}

/// Run the keyboard-interactive exchange, answering the single prompt with enter.
async fn log_in(handle: &mut client::Handle<TrustingClient>) -> KeyboardInteractiveAuthResponse {
    let first = handle
        .authenticate_keyboard_interactive_start("anyone", None::<String>)
        .await
        .unwrap();
    match first {
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => {
            assert_eq!(name, "Log in to GitHub");
            assert_eq!(instructions, "Go to https://x and enter the code 1234");
            assert_eq!(prompts.len(), 1);
            assert_eq!(prompts[0].prompt, "Press enter to continue...");
            assert!(prompts[0].echo);
            handle
                .authenticate_keyboard_interactive_respond(vec![String::new()])
                .await
                .unwrap()
        }
        other => other,
    }
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(20), future)
        .await
        .expect("test timed out")
}

#[tokio::test]
async fn device_login_then_single_session_per_channel() {
    within(async {
        let provider = approving_provider().await;
        let shell = Arc::new(CountingShell::default());
        let (addr, gateway) = start_gateway(&provider, shell.clone(), 8).await;

        let mut handle = connect(addr).await;
        let result = log_in(&mut handle).await;
        assert!(matches!(result, KeyboardInteractiveAuthResponse::Success));

        let mut channel = handle.channel_open_session().await.unwrap();
        channel.request_shell(true).await.unwrap();
        channel.request_shell(false).await.unwrap();

        let mut output = Vec::new();
        let mut acknowledged = false;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Success => acknowledged = true,
                ChannelMsg::Data { data } => output.extend_from_slice(&data),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        assert!(acknowledged);
        assert_eq!(String::from_utf8(output).unwrap(), "hello alice\r\n");
        assert_eq!(shell.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(*shell.logins.lock().unwrap(), vec!["alice".to_string()]);
        gateway.shutdown();
    })
    .await;
}

#[tokio::test]
async fn forwarding_channels_are_rejected() {
    within(async {
        let provider = approving_provider().await;
        let shell = Arc::new(CountingShell::default());
        let (addr, gateway) = start_gateway(&provider, shell.clone(), 8).await;

        let mut handle = connect(addr).await;
        assert!(matches!(
            log_in(&mut handle).await,
            KeyboardInteractiveAuthResponse::Success
        ));

        for port in [80, 443] {
            let opened = handle
                .channel_open_direct_tcpip("localhost", port, "127.0.0.1", 0)
                .await;
            assert!(opened.is_err());
        }
        // The connection survives the rejections.
        let channel = handle.channel_open_session().await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(shell.invocations.load(Ordering::SeqCst), 0);
        gateway.shutdown();
    })
    .await;
}

#[tokio::test]
async fn provider_failure_rejects_authentication() {
    within(async {
        let provider = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&provider)
            .await;
        let shell = Arc::new(CountingShell::default());
        let (addr, gateway) = start_gateway(&provider, shell.clone(), 8).await;

        let mut handle = connect(addr).await;
        let result = handle
            .authenticate_keyboard_interactive_start("anyone", None::<String>)
            .await
            .unwrap();

        assert!(matches!(
            result,
            KeyboardInteractiveAuthResponse::Failure { .. }
        ));
        assert_eq!(shell.invocations.load(Ordering::SeqCst), 0);
        gateway.shutdown();
    })
    .await;
}

#[tokio::test]
async fn shutdown_stops_the_accept_loop() {
    within(async {
        let provider = approving_provider().await;
        let shell = Arc::new(CountingShell::default());
        let config = GatewayConfig::from_lookup(|key| match key {
            "OIDC_CODE_ENDPOINT" => Some(format!("{}/device/code", provider.uri())),
            "OIDC_TOKEN_ENDPOINT" => Some(format!("{}/token", provider.uri())),
            "OIDC_CLIENT_ID" => Some("client-1".to_string()),
            "HOST_KEY_PATH" => Some(format!(
                "{}/tests/fixtures/host_ed25519",
                env!("CARGO_MANIFEST_DIR")
            )),
            _ => None,
        })
        .unwrap();
        let gateway = Arc::new(Gateway::from_config(&config, shell).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let serving = gateway.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });
        gateway.shutdown();

        assert!(task.await.unwrap().is_ok());
        assert!(gateway.shutdown_token().is_cancelled());
    })
    .await;
}

async fn token_polls(provider: &MockServer) -> usize {
    provider
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/token")
        .count()
}

#[tokio::test]
async fn hangup_during_polling_stops_login_and_frees_the_slot() {
    within(async {
        let provider = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(form(
                "device_code=STALL&user_code=1234&verification_uri=https%3A%2F%2Fx&expires_in=900&interval=1",
            ))
            .up_to_n_times(1)
            .mount(&provider)
            .await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(form(
                "device_code=D&user_code=1234&verification_uri=https%3A%2F%2Fx&expires_in=900&interval=1",
            ))
            .mount(&provider)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=STALL"))
            .respond_with(form("error=authorization_pending"))
            .mount(&provider)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=D"))
            .respond_with(form("access_token=T&token_type=bearer&scope=read"))
            .mount(&provider)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "login": "alice" })))
            .mount(&provider)
            .await;
        let shell = Arc::new(CountingShell::default());
        let (addr, gateway) = start_gateway(&provider, shell, 1).await;

        let mut stalled = connect(addr).await;
        let first = stalled
            .authenticate_keyboard_interactive_start("anyone", None::<String>)
            .await
            .unwrap();
        assert!(matches!(
            first,
            KeyboardInteractiveAuthResponse::InfoRequest { .. }
        ));
        tokio::select! {
            _ = stalled.authenticate_keyboard_interactive_respond(vec![String::new()]) => {
                panic!("login finished while the provider was still pending");
            }
            _ = tokio::time::sleep(Duration::from_millis(2500)) => {}
        }
        let _ = stalled
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        drop(stalled);

        let polls_at_hangup = token_polls(&provider).await;
        assert!(polls_at_hangup >= 2);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let polls_later = token_polls(&provider).await;
        assert!(
            polls_later <= polls_at_hangup + 1,
            "polling continued after hangup: {polls_at_hangup} -> {polls_later}"
        );

        // The only connection slot is free again.
        let mut next = connect(addr).await;
        assert!(matches!(
            log_in(&mut next).await,
            KeyboardInteractiveAuthResponse::Success
        ));
        gateway.shutdown();
    })
    .await;
}

#[tokio::test]
async fn simultaneous_connections_authenticate_independently() {
    within(async {
        let provider = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(form(
                "device_code=BAD&user_code=1234&verification_uri=https%3A%2F%2Fx&expires_in=900&interval=1",
            ))
            .up_to_n_times(1)
            .mount(&provider)
            .await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(form(
                "device_code=GOOD&user_code=1234&verification_uri=https%3A%2F%2Fx&expires_in=900&interval=1",
            ))
            .mount(&provider)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=BAD"))
            .respond_with(form("error=access_denied"))
            .expect(1)
            .mount(&provider)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=GOOD"))
            .respond_with(form("access_token=T&token_type=bearer&scope=read"))
            .expect(3)
            .mount(&provider)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "login": "alice" })))
            .mount(&provider)
            .await;
        let shell = Arc::new(CountingShell::default());
        let (addr, gateway) = start_gateway(&provider, shell, 8).await;

        let attempts = (0..4).map(|_| async move {
            let mut handle = connect(addr).await;
            log_in(&mut handle).await
        });
        let results = join_all(attempts).await;

        let succeeded = results
            .iter()
            .filter(|result| matches!(result, KeyboardInteractiveAuthResponse::Success))
            .count();
        let failed = results
            .iter()
            .filter(|result| matches!(result, KeyboardInteractiveAuthResponse::Failure { .. }))
            .count();
        assert_eq!((succeeded, failed), (3, 1));
        gateway.shutdown();
    })
    .await;
}

#[tokio::test]
async fn oversized_connection_cap_does_not_panic() {
    let provider = approving_provider().await;
    let shell = Arc::new(CountingShell::default());

    let (addr, gateway) = start_gateway(&provider, shell, usize::MAX).await;

    let mut handle = connect(addr).await;
    assert!(matches!(
        log_in(&mut handle).await,
        KeyboardInteractiveAuthResponse::Success
    ));
    gateway.shutdown();
}
