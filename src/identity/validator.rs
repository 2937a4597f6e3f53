use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use reqwest::Client;
use tokio::sync::RwLock;

use crate::identity::claims::Claims;
use crate::identity::error::{AuthError, AuthResult};

pub const BOT_FRAMEWORK_ISSUER: &str = "https://api.botframework.com";
pub const BOT_FRAMEWORK_JWKS_URL: &str = "https://login.botframework.com/v1/.well-known/keys";

const ASYMMETRIC_ALGORITHMS: [Algorithm; 5] = [
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Validates inbound bearer tokens and returns their claims.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> AuthResult<Claims>;
}

/// Requires an application role in the `roles` claim.
#[derive(Debug, Clone)]
pub struct AppRolePolicy {
    required_role: String,
}

impl AppRolePolicy {
    pub fn new(required_role: impl Into<String>) -> Self {
        Self {
            required_role: required_role.into(),
        }
    }

    pub fn required_role(&self) -> &str {
        &self.required_role
    }

    pub fn authorize(&self, claims: &Claims) -> AuthResult<()> {
        if claims.has_role(&self.required_role) {
            Ok(())
        } else {
            Err(AuthError::MissingRole(self.required_role.clone()))
        }
    }
}

pub enum KeySource {
    Jwks(JwksCache),
    Static { key: DecodingKey, algorithm: Algorithm },
}

pub struct JwksCache {
    url: String,
    client: Client,
    max_age: Duration,
    min_refresh_interval: Duration,
    state: RwLock<KeyState>,
}

struct CachedKeys {
    set: JwkSet,
    fetched_at: Instant,
}

#[derive(Default)]
struct KeyState {
    cached: Option<CachedKeys>,
    last_attempt: Option<Instant>,
}

impl KeyState {
    fn lookup(&self, kid: &str, max_age: Duration) -> Option<AuthResult<DecodingKey>> {
        let cached = self.cached.as_ref()?;
        if cached.fetched_at.elapsed() >= max_age {
            return None;
        }
        cached
            .set
            .find(kid)
            .map(|jwk| decoding_key_for_algorithm(&jwk.algorithm))
    }

    /// Unknown kids may only trigger a download once per refresh interval.
    fn may_refetch(&self, max_age: Duration, min_interval: Duration) -> bool {
        if let Some(cached) = &self.cached
            && cached.fetched_at.elapsed() >= max_age
        {
            return true;
        }
        match self.last_attempt {
            Some(at) if self.cached.is_some() => at.elapsed() >= min_interval,
            Some(at) => at.elapsed() >= FAILED_FETCH_BACKOFF,
            None => true,
        }
    }
}

const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const FAILED_FETCH_BACKOFF: Duration = Duration::from_secs(10);

impl JwksCache {
    pub fn new(url: impl Into<String>, client: Client) -> Self {
        Self {
            url: url.into(),
            client,
            max_age: Duration::from_secs(24 * 60 * 60),
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            state: RwLock::new(KeyState::default()),
        }
    }

    async fn key_for(&self, kid: &str) -> AuthResult<DecodingKey> {
        {
            let state = self.state.read().await;
            if let Some(key) = state.lookup(kid, self.max_age) {
                return key;
            }
            if !state.may_refetch(self.max_age, self.min_refresh_interval) {
                return Err(unknown_kid(kid));
            }
        }

        // Held across the download so concurrent misses share one fetch.
        let mut state = self.state.write().await;
        if let Some(key) = state.lookup(kid, self.max_age) {
            return key;
        }
        if !state.may_refetch(self.max_age, self.min_refresh_interval) {
            return Err(unknown_kid(kid));
        }
        state.last_attempt = Some(Instant::now());
        let set = self.fetch().await?;
        state.cached = Some(CachedKeys {
            set,
            fetched_at: Instant::now(),
        });
        state
            .lookup(kid, self.max_age)
            .unwrap_or_else(|| Err(unknown_kid(kid)))
    }

    async fn fetch(&self) -> AuthResult<JwkSet> {
        tracing::debug!(event = "jwks_fetch", url = %self.url, "fetching signing keys");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(format!("jwks fetch failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AuthError::Unavailable(format!(
                "jwks endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<JwkSet>()
            .await
            .map_err(|err| AuthError::Unavailable(format!("malformed jwks: {err}")))
    }
}

pub struct JwtValidator {
    keys: KeySource,
    issuers: Vec<String>,
    audiences: Vec<String>,
    leeway_secs: u64,
}

impl JwtValidator {
    pub fn new(keys: KeySource) -> Self {
        Self {
            keys,
            issuers: Vec::new(),
            audiences: Vec::new(),
            leeway_secs: 60,
        }
    }

    /// Tokens issued by the tenant's Azure AD, v1 or v2 endpoint.
    pub fn azure_ad(
        tenant_id: &str,
        audiences: Vec<String>,
        jwks_url: Option<String>,
        client: Client,
    ) -> Self {
        let url = jwks_url.unwrap_or_else(|| {
            format!("https://login.microsoftonline.com/{tenant_id}/discovery/v2.0/keys")
        });
        Self::new(KeySource::Jwks(JwksCache::new(url, client)))
            .with_issuers(vec![
                format!("https://login.microsoftonline.com/{tenant_id}/v2.0"),
                format!("https://sts.windows.net/{tenant_id}/"),
            ])
            .with_audiences(audiences)
    }

    /// Tokens the Bot Framework channel attaches to inbound activities.
    pub fn bot_framework(app_id: &str, client: Client) -> Self {
        Self::new(KeySource::Jwks(JwksCache::new(BOT_FRAMEWORK_JWKS_URL, client)))
            .with_issuers(vec![BOT_FRAMEWORK_ISSUER.to_string()])
            .with_audiences(vec![app_id.to_string()])
    }

    pub fn with_static_key(key: DecodingKey, algorithm: Algorithm) -> Self {
        Self::new(KeySource::Static { key, algorithm })
    }

    pub fn with_issuers(mut self, issuers: Vec<String>) -> Self {
        self.issuers = issuers;
        self
    }

    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.leeway_secs;
        if self.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.audiences);
        }
        if !self.issuers.is_empty() {
            validation.set_issuer(&self.issuers);
        }
        validation
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> AuthResult<Claims> {
        let header =
            decode_header(token).map_err(|err| AuthError::InvalidToken(err.to_string()))?;
        let (key, algorithm) = match &self.keys {
            KeySource::Static { key, algorithm } => (key.clone(), *algorithm),
            KeySource::Jwks(cache) => {
                if !ASYMMETRIC_ALGORITHMS.contains(&header.alg) {
                    return Err(AuthError::InvalidToken(format!(
                        "unsupported algorithm {:?}",
                        header.alg
                    )));
                }
                let Some(kid) = header.kid.as_deref() else {
                    return Err(AuthError::InvalidToken("missing kid in token header".to_string()));
                };
                (cache.key_for(kid).await?, header.alg)
            }
        };
        decode::<Claims>(token, &key, &self.validation(algorithm))
            .map(|data| data.claims)
            .map_err(|err| AuthError::InvalidToken(err.to_string()))
    }
}

fn unknown_kid(kid: &str) -> AuthError {
    AuthError::InvalidToken(format!("signing key {kid} not found"))
}

fn decoding_key_for_algorithm(alg: &AlgorithmParameters) -> AuthResult<DecodingKey> {
    let key = match alg {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y),
        _ => {
            return Err(AuthError::InvalidToken(
                "unsupported signing key type".to_string(),
            ));
        }
    };
    key.map_err(|err| AuthError::InvalidToken(err.to_string()))
}

/// Pulls the token out of an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: Option<&str>) -> AuthResult<&str> {
    let value = header.ok_or(AuthError::MissingToken)?;
    let (scheme, token) = value.trim().split_once(' ').ok_or(AuthError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingToken);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}
