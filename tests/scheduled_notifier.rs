use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};

use teams_relay::config::SchedulerConfig;
use teams_relay::identity::credential::{AccessToken, CredentialProvider};
use teams_relay::identity::error::{AuthError, AuthResult};
use teams_relay::scheduler::notifier::{ScheduledNotifier, TickOutcome};

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

impl Captured {
    fn requests(&self) -> Vec<(HeaderMap, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn capture(
    State((captured, status)): State<(Captured, StatusCode)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    captured.requests.lock().unwrap().push((headers, body));
    (status, "relay said no".to_string())
}

async fn spawn_relay(status: StatusCode) -> (String, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/api/teamsmessage/send", post(capture))
        .with_state((captured.clone(), status));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), captured)
}

struct StubCredential {
    calls: AtomicUsize,
    scopes: Mutex<Vec<String>>,
    fail: Option<AuthError>,
}

impl StubCredential {
    fn issuing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            scopes: Mutex::new(Vec::new()),
            fail: None,
        }
    }

    fn failing(err: AuthError) -> Self {
        Self {
            fail: Some(err),
            ..Self::issuing()
        }
    }
}

#[async_trait]
impl CredentialProvider for StubCredential {
    async fn acquire_token(&self, scope: &str) -> AuthResult<AccessToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scopes.lock().unwrap().push(scope.to_string());
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        let token = encode(
            &Header::default(),
            &json!({"roles": ["Messages.Send"], "exp": chrono::Utc::now().timestamp() + 3600}),
            &EncodingKey::from_secret(b"stub"),
        )
        .unwrap();
        Ok(AccessToken {
            token,
            expires_on: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }
}

fn config(bot_api_url: Option<String>, scope: Option<&str>) -> SchedulerConfig {
    SchedulerConfig {
        bot_api_url,
        bot_api_scope: scope.map(str::to_string),
        bot_api_key: Some("relay-key".to_string()),
        chat_id: Some("19:abc@thread.v2".to_string()),
        service_url: Some("https://smba.trafficmanager.net/amer/".to_string()),
        tenant_id: Some("tenant-a".to_string()),
        message: Some("Nightly report ready".to_string()),
        timeout_secs: Some(5),
        ..SchedulerConfig::default()
    }
}

#[tokio::test]
async fn tick_posts_one_authenticated_notification() {
    let (url, captured) = spawn_relay(StatusCode::OK).await;
    let credential = Arc::new(StubCredential::issuing());
    let notifier = ScheduledNotifier::new(
        config(Some(url), Some("api://relay-api/.default")),
        credential.clone(),
    )
    .unwrap();

    let outcome = notifier.tick().await;

    assert_eq!(outcome, TickOutcome::Delivered { status: 200 });
    assert_eq!(credential.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        credential.scopes.lock().unwrap().as_slice(),
        ["api://relay-api/.default".to_string()]
    );

    let requests = captured.requests();
    assert_eq!(requests.len(), 1);
    let (headers, body) = &requests[0];
    let authorization = headers.get("authorization").unwrap().to_str().unwrap();
    assert!(authorization.starts_with("Bearer "));
    assert_eq!(headers.get("x-api-key").unwrap(), "relay-key");
    assert_eq!(body["text"], "Nightly report ready");
    assert_eq!(body["chatId"], "19:abc@thread.v2");
    assert_eq!(body["serviceUrl"], "https://smba.trafficmanager.net/amer/");
    assert_eq!(body["tenantId"], "tenant-a");
}

#[tokio::test]
async fn tick_without_scope_makes_no_calls() {
    let (url, captured) = spawn_relay(StatusCode::OK).await;
    let credential = Arc::new(StubCredential::issuing());
    let notifier = ScheduledNotifier::new(config(Some(url), None), credential.clone()).unwrap();

    let outcome = notifier.tick().await;

    assert!(matches!(outcome, TickOutcome::Skipped { .. }));
    assert_eq!(credential.calls.load(Ordering::SeqCst), 0);
    assert!(captured.requests().is_empty());
}

#[tokio::test]
async fn tick_without_url_makes_no_calls() {
    let credential = Arc::new(StubCredential::issuing());
    let notifier = ScheduledNotifier::new(
        config(None, Some("api://relay-api/.default")),
        credential.clone(),
    )
    .unwrap();

    assert!(matches!(notifier.tick().await, TickOutcome::Skipped { .. }));
    assert_eq!(credential.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_notification_is_reported_not_retried() {
    let (url, captured) = spawn_relay(StatusCode::FORBIDDEN).await;
    let notifier = ScheduledNotifier::new(
        config(Some(url), Some("api://relay-api/.default")),
        Arc::new(StubCredential::issuing()),
    )
    .unwrap();

    let outcome = notifier.tick().await;

    assert_eq!(
        outcome,
        TickOutcome::Rejected {
            status: 403,
            body: "relay said no".to_string(),
        }
    );
    assert_eq!(captured.requests().len(), 1);
}

#[tokio::test]
async fn credential_failure_skips_the_post() {
    let (url, captured) = spawn_relay(StatusCode::OK).await;
    let notifier = ScheduledNotifier::new(
        config(Some(url), Some("api://wrong/.default")),
        Arc::new(StubCredential::failing(AuthError::AuthenticationFailed {
            code: "AADSTS70011".to_string(),
            message: "The provided value for scope is not valid.".to_string(),
        })),
    )
    .unwrap();

    let outcome = notifier.tick().await;

    assert!(matches!(outcome, TickOutcome::AuthFailed { .. }));
    assert!(captured.requests().is_empty());
}

/// Answers with a status line and a truncated body, then hangs up.
async fn spawn_truncating_relay() -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = socket.read(&mut buf).await.unwrap();
            if read == 0 {
                break;
            }
            received.extend_from_slice(&buf[..read]);
            let text = String::from_utf8_lossy(&received).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if received.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        socket
            .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 64\r\n\r\npartial")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn unreadable_rejection_body_is_reported() {
    let url = spawn_truncating_relay().await;
    let notifier = ScheduledNotifier::new(
        config(Some(url), Some("api://relay-api/.default")),
        Arc::new(StubCredential::issuing()),
    )
    .unwrap();

    match notifier.tick().await {
        TickOutcome::Rejected { status, body } => {
            assert_eq!(status, 502);
            assert!(body.starts_with("<unreadable body"), "body was {body:?}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}
