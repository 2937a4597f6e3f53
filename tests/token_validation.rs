use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, encode};
use serde_json::{Value, json};

use teams_relay::identity::error::AuthError;
use teams_relay::identity::validator::{AppRolePolicy, JwtValidator, TokenValidator};

const SECRET: &[u8] = b"validation-secret";
const TENANT: &str = "tenant-a";

fn validator() -> JwtValidator {
    JwtValidator::with_static_key(DecodingKey::from_secret(SECRET), Algorithm::HS256)
        .with_issuers(vec![
            format!("https://login.microsoftonline.com/{TENANT}/v2.0"),
            format!("https://sts.windows.net/{TENANT}/"),
        ])
        .with_audiences(vec!["api://relay-api".to_string(), "relay-api".to_string()])
}

fn mint(claims: Value) -> String {
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

fn future_exp() -> i64 {
    chrono::Utc::now().timestamp() + 600
}

#[tokio::test]
async fn accepts_v1_and_v2_issuers() {
    let validator = validator();
    let v2 = mint(json!({
        "iss": format!("https://login.microsoftonline.com/{TENANT}/v2.0"),
        "aud": "relay-api",
        "exp": future_exp(),
        "azp": "caller-v2",
        "roles": ["Messages.Send"],
    }));
    let v1 = mint(json!({
        "iss": format!("https://sts.windows.net/{TENANT}/"),
        "aud": "api://relay-api",
        "exp": future_exp(),
        "appid": "caller-v1",
    }));

    let claims = validator.validate(&v2).await.unwrap();
    assert_eq!(claims.caller_app_id(), Some("caller-v2"));
    assert!(claims.has_role("Messages.Send"));

    let claims = validator.validate(&v1).await.unwrap();
    assert_eq!(claims.caller_app_id(), Some("caller-v1"));
    assert!(claims.roles.is_empty());
}

#[tokio::test]
async fn rejects_foreign_tenant_issuer() {
    let token = mint(json!({
        "iss": "https://login.microsoftonline.com/other-tenant/v2.0",
        "aud": "relay-api",
        "exp": future_exp(),
    }));

    let err = validator().validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)));
}

#[tokio::test]
async fn rejects_wrong_audience() {
    let token = mint(json!({
        "iss": format!("https://sts.windows.net/{TENANT}/"),
        "aud": "api://someone-else",
        "exp": future_exp(),
    }));

    assert!(validator().validate(&token).await.is_err());
}

#[tokio::test]
async fn rejects_expired_token() {
    let token = mint(json!({
        "iss": format!("https://sts.windows.net/{TENANT}/"),
        "aud": "relay-api",
        "exp": chrono::Utc::now().timestamp() - 3600,
    }));

    assert!(validator().validate(&token).await.is_err());
}

#[tokio::test]
async fn role_policy_distinguishes_missing_role() {
    let token = mint(json!({
        "iss": format!("https://sts.windows.net/{TENANT}/"),
        "aud": "relay-api",
        "exp": future_exp(),
        "roles": ["Reports.Read"],
    }));
    let claims = validator().validate(&token).await.unwrap();

    let err = AppRolePolicy::new("Messages.Send")
        .authorize(&claims)
        .unwrap_err();
    assert!(err.is_forbidden());
}

// Headers are `{"alg":"RS256","kid":"rotating-N"}`; the signature is never reached.
const UNKNOWN_KID_TOKENS: [&str; 3] = [
    "eyJhbGciOiJSUzI1NiIsImtpZCI6InJvdGF0aW5nLTEifQ.eyJzdWIiOiJ4In0.c2ln",
    "eyJhbGciOiJSUzI1NiIsImtpZCI6InJvdGF0aW5nLTIifQ.eyJzdWIiOiJ4In0.c2ln",
    "eyJhbGciOiJSUzI1NiIsImtpZCI6InJvdGF0aW5nLTMifQ.eyJzdWIiOiJ4In0.c2ln",
];

async fn serve_empty_jwks() -> (String, Arc<AtomicUsize>) {
    async fn keys(State(hits): State<Arc<AtomicUsize>>) -> axum::Json<Value> {
        hits.fetch_add(1, Ordering::SeqCst);
        axum::Json(json!({ "keys": [] }))
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/keys", get(keys))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/keys"), hits)
}

fn jwks_validator(url: String) -> JwtValidator {
    JwtValidator::azure_ad(
        TENANT,
        vec!["api://relay-api".to_string()],
        Some(url),
        reqwest::Client::new(),
    )
}

#[tokio::test]
async fn unknown_kids_do_not_refetch_within_refresh_interval() {
    let (url, hits) = serve_empty_jwks().await;
    let validator = jwks_validator(url);

    for round in 0..30 {
        let token = UNKNOWN_KID_TOKENS[round % UNKNOWN_KID_TOKENS.len()];
        let err = validator.validate(token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_misses_share_one_fetch() {
    let (url, hits) = serve_empty_jwks().await;
    let validator = Arc::new(jwks_validator(url));

    let tasks = (0..12)
        .map(|index| {
            let validator = validator.clone();
            tokio::spawn(async move {
                validator
                    .validate(UNKNOWN_KID_TOKENS[index % UNKNOWN_KID_TOKENS.len()])
                    .await
            })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
