use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::identity::claims::Claims;
use crate::identity::error::AuthError;
use crate::identity::validator::bearer_token;

use super::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The authenticated service identity behind a relay request.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub app_id: Option<String>,
    pub roles: Vec<String>,
}

impl From<&Claims> for CallerIdentity {
    fn from(claims: &Claims) -> Self {
        Self {
            app_id: claims.caller_app_id().map(str::to_string),
            roles: claims.roles.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthErrorBody {
    error: String,
}

/// Guard for `send` / `send-card`: valid bearer token carrying the app role,
/// then the optional static API key. Runs before the body is read.
pub async fn require_app_role(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match bearer_token(
        request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    ) {
        Ok(token) => token.to_string(),
        Err(err) => return reject(err),
    };
    let claims = match state.caller_validator.validate(&token).await {
        Ok(claims) => claims,
        Err(err) => return reject(err),
    };
    if let Err(err) = state.role_policy.authorize(&claims) {
        return reject(err);
    }
    if let Err(response) = check_api_key(request.headers(), &state.api_keys) {
        return *response;
    }
    request
        .extensions_mut()
        .insert(CallerIdentity::from(&claims));
    next.run(request).await
}

pub fn check_api_key(headers: &HeaderMap, api_keys: &[String]) -> Result<(), Box<Response>> {
    if api_keys.is_empty() {
        return Ok(());
    }
    let Some(value) = headers.get(API_KEY_HEADER) else {
        return Err(Box::new(
            (StatusCode::UNAUTHORIZED, "missing api key").into_response(),
        ));
    };
    let Ok(value) = value.to_str() else {
        return Err(Box::new(
            (StatusCode::UNAUTHORIZED, "invalid api key").into_response(),
        ));
    };
    if api_keys.iter().any(|allowed| allowed == value) {
        return Ok(());
    }
    Err(Box::new(
        (StatusCode::UNAUTHORIZED, "invalid api key").into_response(),
    ))
}

pub fn reject(err: AuthError) -> Response {
    let status = if err.is_forbidden() {
        StatusCode::FORBIDDEN
    } else if matches!(err, AuthError::Unavailable(_)) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::UNAUTHORIZED
    };
    tracing::warn!(
        event = "auth_rejected",
        status = status.as_u16(),
        error = %err,
        "request rejected by auth guard"
    );
    let mut response = (
        status,
        Json(AuthErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response();
    if status == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer"),
        );
    }
    response
}
