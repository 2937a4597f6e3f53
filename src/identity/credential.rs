use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::identity::error::{AuthError, AuthResult};

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

impl AccessToken {
    pub fn expires_within(&self, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        self.expires_on <= Utc::now() + margin
    }
}

/// Issues bearer tokens for service-to-service calls.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn acquire_token(&self, scope: &str) -> AuthResult<AccessToken>;
}

#[derive(Debug, Clone)]
pub enum IdentityEndpoint {
    /// App Service and Functions hosts expose a local endpoint guarded by a header secret.
    AppService { endpoint: String, header: String },
    Imds { endpoint: String },
}

impl IdentityEndpoint {
    pub fn from_env() -> Self {
        let endpoint = std::env::var("IDENTITY_ENDPOINT").ok();
        let header = std::env::var("IDENTITY_HEADER").ok();
        match (endpoint, header) {
            (Some(endpoint), Some(header)) if !endpoint.is_empty() && !header.is_empty() => {
                IdentityEndpoint::AppService { endpoint, header }
            }
            _ => IdentityEndpoint::Imds {
                endpoint: IMDS_ENDPOINT.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagedIdentityCredential {
    client: Client,
    endpoint: IdentityEndpoint,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    pub fn new(
        endpoint: IdentityEndpoint,
        client_id: Option<String>,
        timeout: Duration,
    ) -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            client_id,
        })
    }

    pub fn from_env(client_id: Option<String>, timeout: Duration) -> AuthResult<Self> {
        Self::new(IdentityEndpoint::from_env(), client_id, timeout)
    }
}

#[async_trait]
impl CredentialProvider for ManagedIdentityCredential {
    async fn acquire_token(&self, scope: &str) -> AuthResult<AccessToken> {
        let resource = scope_to_resource(scope);
        let mut query = vec![("resource", resource.to_string())];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.clone()));
        }
        let request = match &self.endpoint {
            IdentityEndpoint::AppService { endpoint, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION.to_string()));
                self.client
                    .get(endpoint)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            IdentityEndpoint::Imds { endpoint } => {
                query.push(("api-version", IMDS_API_VERSION.to_string()));
                self.client
                    .get(endpoint)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };
        let response = request
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(format!("managed identity endpoint: {err}")))?;
        read_token_response(response).await
    }
}

#[derive(Debug, Clone)]
pub struct ClientSecretCredential {
    client: Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }
}

#[async_trait]
impl CredentialProvider for ClientSecretCredential {
    async fn acquire_token(&self, scope: &str) -> AuthResult<AccessToken> {
        let response = self
            .client
            .post(self.token_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(format!("token endpoint: {err}")))?;
        read_token_response(response).await
    }
}

/// Reuses tokens per scope until they are about to expire.
#[derive(Clone)]
pub struct CachingCredential {
    inner: Arc<dyn CredentialProvider>,
    cache: Arc<DashMap<String, AccessToken>>,
    refresh_margin: Duration,
}

impl CachingCredential {
    pub fn new(inner: Arc<dyn CredentialProvider>) -> Self {
        Self {
            inner,
            cache: Arc::new(DashMap::new()),
            refresh_margin: Duration::from_secs(300),
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }
}

#[async_trait]
impl CredentialProvider for CachingCredential {
    async fn acquire_token(&self, scope: &str) -> AuthResult<AccessToken> {
        let cached = self.cache.get(scope).map(|entry| entry.value().clone());
        if let Some(cached) = cached
            && !cached.expires_within(self.refresh_margin)
        {
            return Ok(cached);
        }
        let token = self.inner.acquire_token(scope).await?;
        self.cache.insert(scope.to_string(), token.clone());
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<Value>,
    expires_on: Option<Value>,
}

async fn read_token_response(response: reqwest::Response) -> AuthResult<AccessToken> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| AuthError::Unavailable(err.to_string()))?;
    if !status.is_success() {
        return Err(parse_error_body(status.as_u16(), &body));
    }
    let payload: TokenResponse = serde_json::from_str(&body)
        .map_err(|err| AuthError::Unavailable(format!("malformed token response: {err}")))?;
    let token = payload
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::Unavailable("token response missing access_token".to_string()))?;
    let expires_on = payload
        .expires_on
        .as_ref()
        .and_then(value_as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .or_else(|| {
            payload
                .expires_in
                .as_ref()
                .and_then(value_as_i64)
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
        })
        .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(3600));
    Ok(AccessToken { token, expires_on })
}

/// Extracts the provider diagnostic code, preferring the `AADSTSnnnnn` form.
pub fn parse_error_body(status: u16, body: &str) -> AuthError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|value| {
            value
                .get("error_description")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
        })
        .unwrap_or(body)
        .to_string();
    let error_field = parsed
        .as_ref()
        .and_then(|value| value.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let code = extract_aadsts_code(&description)
        .or(error_field)
        .unwrap_or_else(|| format!("http_{status}"));
    AuthError::AuthenticationFailed {
        code,
        message: description,
    }
}

fn extract_aadsts_code(text: &str) -> Option<String> {
    let start = text.find("AADSTS")?;
    let digits: String = text[start + 6..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("AADSTS{digits}"))
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// `api://x/.default` becomes the v1 resource `api://x`.
pub fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn scope_strips_default_suffix() {
        assert_eq!(scope_to_resource("api://abc/.default"), "api://abc");
        assert_eq!(scope_to_resource("api://abc"), "api://abc");
    }

    #[test]
    fn error_body_prefers_aadsts_code() {
        let body = r#"{"error":"invalid_scope","error_description":"AADSTS70011: The provided request must include a 'scope' input parameter."}"#;
        let err = parse_error_body(400, body);
        match &err {
            AuthError::AuthenticationFailed { code, .. } => assert_eq!(code, "AADSTS70011"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_scope_problem());
    }

    #[test]
    fn error_body_falls_back_to_error_field_then_status() {
        let err = parse_error_body(401, r#"{"error":"unauthorized_client"}"#);
        assert!(matches!(
            err,
            AuthError::AuthenticationFailed { ref code, .. } if code == "unauthorized_client"
        ));
        let err = parse_error_body(503, "upstream down");
        assert!(matches!(
            err,
            AuthError::AuthenticationFailed { ref code, ref message } if code == "http_503" && message == "upstream down"
        ));
    }

    struct CountingCredential {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl CredentialProvider for CountingCredential {
        async fn acquire_token(&self, _scope: &str) -> AuthResult<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("token-{n}"),
                expires_on: Utc::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn caching_credential_reuses_fresh_tokens() {
        let inner = Arc::new(CountingCredential {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
        });
        let cache = CachingCredential::new(inner.clone());
        let first = cache.acquire_token("scope-a").await.unwrap();
        let second = cache.acquire_token("scope-a").await.unwrap();
        assert_eq!(first.token, second.token);
        cache.acquire_token("scope-b").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn caching_credential_refreshes_near_expiry() {
        let inner = Arc::new(CountingCredential {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::seconds(60),
        });
        let cache = CachingCredential::new(inner.clone());
        cache.acquire_token("scope").await.unwrap();
        cache.acquire_token("scope").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
