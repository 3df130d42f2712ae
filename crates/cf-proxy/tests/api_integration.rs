//! API integration tests
//!
//! Runs the API server on an ephemeral loopback port and drives it the way
//! a front end would: one JSON line out, one JSON line back.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use cf_auth::otp::{hotp, parse_otp_url};
use cf_auth::password::PasswordCost;
use cf_auth::{AuthConfig, AuthServer, Role, StandardPermissions};
use cf_core::config::ProxyConfig;
use cf_core::services::{MemoryEventLog, MemoryStore, Unlimited};
use cf_core::CURRENT_SITE_SHORTCUT;
use cf_protocol::{NodeHeartbeat, PresenceUpdate};
use cf_proxy::api::{ApiCall, ApiRequest, ApiResponse, ApiServer, ApiSession};
use cf_proxy::{Gateway, ProxyServices, ProxyState};

const DOMAIN: &str = "example.com";

async fn create_test_state() -> Arc<ProxyState> {
    let events = Arc::new(MemoryEventLog::new());
    let auth = AuthServer::new(
        AuthConfig {
            domain: DOMAIN.to_string(),
            password_cost: PasswordCost::minimal(),
            ..AuthConfig::default()
        },
        Arc::new(MemoryStore::new()),
        events.clone(),
        Arc::new(StandardPermissions),
    );
    let config = ProxyConfig {
        domain: DOMAIN.to_string(),
        host: "proxy".to_string(),
        require_cookie: true,
        ..ProxyConfig::default()
    };
    ProxyState::bootstrap(
        config,
        auth,
        ProxyServices {
            events,
            limiter: Arc::new(Unlimited),
        },
    )
    .await
    .unwrap()
}

/// Start a server on an ephemeral port; returns its address
async fn start_server(state: Arc<ProxyState>, cancel: CancellationToken) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = ApiServer::new(address.clone(), Gateway::new(state)).with_shutdown_token(cancel);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    address
}

/// API test client wrapper
struct TestClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl TestClient {
    async fn connect(address: &str) -> Self {
        let stream = TcpStream::connect(address)
            .await
            .expect("Failed to connect to API server");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    async fn send_line(&mut self, line: &str) -> ApiResponse {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();

        let mut response_line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut response_line))
            .await
            .expect("Timeout waiting for response")
            .expect("Failed to read response");
        serde_json::from_str(&response_line).expect("Failed to parse response")
    }

    async fn send(&mut self, request: ApiRequest) -> ApiResponse {
        let line = serde_json::to_string(&request).unwrap();
        self.send_line(&line).await
    }

    async fn call(&mut self, session: &ApiSession, call: ApiCall) -> ApiResponse {
        self.send(ApiRequest::with_session(session, call)).await
    }
}

fn expect_session(response: ApiResponse) -> ApiSession {
    match response {
        ApiResponse::Session(session) => session,
        other => panic!("expected session, got {:?}", other),
    }
}

fn expect_error(response: ApiResponse, code: &str) {
    match response {
        ApiResponse::Error { code: actual, .. } => assert_eq!(actual, code),
        other => panic!("expected {} error, got {:?}", code, other),
    }
}

/// Create an admin account and log it in over the API
async fn admin_session(state: &ProxyState, client: &mut TestClient) -> ApiSession {
    state
        .auth
        .upsert_user("admin", vec!["root".to_string()])
        .await
        .unwrap();
    let setup = state.auth.upsert_password("admin", "admin-pass").await.unwrap();
    state.auth.set_user_role("admin", Role::Admin).await.unwrap();
    let (seed, counter) = parse_otp_url(&setup.otp_url).unwrap();

    expect_session(
        client
            .send(ApiRequest::anonymous(ApiCall::Login {
                user: "admin".to_string(),
                password: "admin-pass".to_string(),
                otp_code: hotp(&seed, counter).unwrap(),
            }))
            .await,
    )
}

#[tokio::test]
async fn test_ping() {
    let cancel = CancellationToken::new();
    let address = start_server(create_test_state().await, cancel.clone()).await;
    let mut client = TestClient::connect(&address).await;

    let response = client.send(ApiRequest::anonymous(ApiCall::Ping)).await;
    assert!(matches!(response, ApiResponse::Pong));
    cancel.cancel();
}

#[tokio::test]
async fn test_invalid_request_keeps_connection() {
    let cancel = CancellationToken::new();
    let address = start_server(create_test_state().await, cancel.clone()).await;
    let mut client = TestClient::connect(&address).await;

    expect_error(client.send_line("not json").await, "bad_request");
    expect_error(
        client.send_line(r#"{"call":{"type":"no_such_call"}}"#).await,
        "bad_request",
    );
    assert!(matches!(
        client.send(ApiRequest::anonymous(ApiCall::Ping)).await,
        ApiResponse::Pong
    ));
    cancel.cancel();
}

#[tokio::test]
async fn test_signup_login_and_logout() {
    let state = create_test_state().await;
    let cancel = CancellationToken::new();
    let address = start_server(state.clone(), cancel.clone()).await;
    let mut client = TestClient::connect(&address).await;
    let admin = admin_session(&state, &mut client).await;

    let token = match client
        .call(
            &admin,
            ApiCall::CreateSignupToken {
                user: "bob".to_string(),
                allowed_logins: vec!["bob".to_string()],
            },
        )
        .await
    {
        ApiResponse::Invite { user, token, .. } => {
            assert_eq!(user, "bob");
            token
        }
        other => panic!("expected invite, got {:?}", other),
    };

    let code = match client
        .send(ApiRequest::anonymous(ApiCall::GetSignupToken {
            token: token.clone(),
        }))
        .await
    {
        ApiResponse::SignupToken {
            user,
            allowed_logins,
            hotp_codes,
            ..
        } => {
            assert_eq!(user, "bob");
            assert_eq!(allowed_logins, vec!["bob".to_string()]);
            hotp_codes[0].clone()
        }
        other => panic!("expected signup token data, got {:?}", other),
    };

    let bob = expect_session(
        client
            .send(ApiRequest::anonymous(ApiCall::RedeemSignupToken {
                token: token.clone(),
                password: "abc123".to_string(),
                otp_code: code.clone(),
            }))
            .await,
    );
    assert_eq!(bob.user, "bob");
    assert!(!bob.bearer_token.is_empty());
    assert_eq!(bob.cookies.len(), 1);

    // Both secrets together are accepted
    assert!(matches!(
        client.call(&bob, ApiCall::ListSites).await,
        ApiResponse::Sites { .. }
    ));

    // Either one alone is not
    let bearer_only = ApiRequest {
        bearer: Some(bob.bearer_token.clone()),
        cookie: None,
        call: ApiCall::ListSites,
    };
    expect_error(client.send(bearer_only).await, "access_denied");
    let cookie_only = ApiRequest {
        bearer: None,
        cookie: Some(bob.cookies[0].value.clone()),
        call: ApiCall::ListSites,
    };
    expect_error(client.send(cookie_only).await, "access_denied");

    // The token is single use
    expect_error(
        client
            .send(ApiRequest::anonymous(ApiCall::RedeemSignupToken {
                token,
                password: "abc123".to_string(),
                otp_code: code,
            }))
            .await,
        "token_already_used",
    );

    assert!(matches!(
        client.call(&bob, ApiCall::Logout).await,
        ApiResponse::Ok
    ));
    expect_error(client.call(&bob, ApiCall::ListSites).await, "access_denied");

    // The admin's session is unaffected
    assert!(matches!(
        client.call(&admin, ApiCall::ListSites).await,
        ApiResponse::Sites { .. }
    ));
    cancel.cancel();
}

#[tokio::test]
async fn test_bad_second_factor() {
    let state = create_test_state().await;
    let cancel = CancellationToken::new();
    let address = start_server(state.clone(), cancel.clone()).await;
    let mut client = TestClient::connect(&address).await;
    let admin = admin_session(&state, &mut client).await;

    let token = match client
        .call(
            &admin,
            ApiCall::CreateSignupToken {
                user: "carol".to_string(),
                allowed_logins: vec!["carol".to_string()],
            },
        )
        .await
    {
        ApiResponse::Invite { token, .. } => token,
        other => panic!("expected invite, got {:?}", other),
    };

    expect_error(
        client
            .send(ApiRequest::anonymous(ApiCall::RedeemSignupToken {
                token,
                password: "abc123".to_string(),
                otp_code: "not-a-code".to_string(),
            }))
            .await,
        "bad_second_factor",
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_current_site_shortcut_matches_explicit_domain() {
    let state = create_test_state().await;
    let cancel = CancellationToken::new();
    let address = start_server(state.clone(), cancel.clone()).await;
    let mut client = TestClient::connect(&address).await;
    let admin = admin_session(&state, &mut client).await;

    for host in ["node-2", "node-1"] {
        state.sessions.apply(PresenceUpdate::Node(NodeHeartbeat {
            domain: DOMAIN.to_string(),
            host: host.to_string(),
            addr: "127.0.0.1:3022".to_string(),
            sent_at: 1_000,
            seq: 1,
        }));
    }

    let shortcut = client
        .call(
            &admin,
            ApiCall::ListNodes {
                site: CURRENT_SITE_SHORTCUT.to_string(),
            },
        )
        .await;
    let explicit = client
        .call(
            &admin,
            ApiCall::ListNodes {
                site: DOMAIN.to_string(),
            },
        )
        .await;
    assert_eq!(
        serde_json::to_string(&shortcut).unwrap(),
        serde_json::to_string(&explicit).unwrap()
    );
    match explicit {
        ApiResponse::Nodes { nodes } => {
            let hosts: Vec<&str> = nodes.iter().map(|n| n.host.as_str()).collect();
            assert_eq!(hosts, vec!["node-1", "node-2"]);
        }
        other => panic!("expected nodes, got {:?}", other),
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_connect_error_keeps_json_mode() {
    let state = create_test_state().await;
    let cancel = CancellationToken::new();
    let address = start_server(state.clone(), cancel.clone()).await;
    let mut client = TestClient::connect(&address).await;
    let admin = admin_session(&state, &mut client).await;

    let connect = ApiCall::Connect {
        site: "remote.net".to_string(),
        host: "far-1".to_string(),
        login: "root".to_string(),
        session_id: None,
        join_only: false,
        command: None,
        rows: 24,
        cols: 80,
    };
    expect_error(client.call(&admin, connect).await, "site_unreachable");
    assert!(matches!(
        client.send(ApiRequest::anonymous(ApiCall::Ping)).await,
        ApiResponse::Pong
    ));
    cancel.cancel();
}
