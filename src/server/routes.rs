use std::collections::BTreeMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::messaging::activity::Activity;
use crate::relay::error::RelayError;
use crate::relay::request::{NotificationPayload, NotificationResult, ValidationErrors};
use crate::relay::service::PayloadKind;

use super::middleware::{CallerIdentity, reject};
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// 400 body listing the offending fields.
#[derive(Debug, Serialize)]
pub struct ValidationProblem {
    pub title: String,
    pub status: u16,
    pub errors: ValidationErrors,
}

pub async fn ready() -> Json<ReadyResponse> {
    Json(ReadyResponse {
        message: "Relay endpoint is ready to send messages.".to_string(),
    })
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Healthy".to_string(),
        timestamp: chrono::Utc::now(),
    })
}

pub async fn send(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<NotificationPayload>, JsonRejection>,
) -> Response {
    relay(state, caller, payload, PayloadKind::Text).await
}

pub async fn send_card(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<NotificationPayload>, JsonRejection>,
) -> Response {
    relay(state, caller, payload, PayloadKind::Card).await
}

async fn relay(
    state: AppState,
    caller: CallerIdentity,
    payload: Result<Json<NotificationPayload>, JsonRejection>,
    kind: PayloadKind,
) -> Response {
    if let Err(err) = state.relay.app_id() {
        return relay_error_response(err, kind, "");
    }
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            let mut errors = ValidationErrors::default();
            errors.add("body", rejection.body_text());
            return validation_response(errors);
        }
    };
    let chat_id = payload.chat_id.clone().unwrap_or_default();
    tracing::info!(
        event = "relay_request",
        kind = kind.label(),
        caller_app_id = caller.app_id.as_deref().unwrap_or("unknown"),
        chat_id = %chat_id,
        "relay request received"
    );
    match state.relay.send(payload, kind).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => relay_error_response(err, kind, &chat_id),
    }
}

fn relay_error_response(err: RelayError, kind: PayloadKind, chat_id: &str) -> Response {
    match err {
        RelayError::Validation(errors) => {
            let fields = errors.fields().collect::<Vec<_>>().join(",");
            tracing::debug!(
                event = "relay_validation_failed",
                fields = %fields,
                "relay request failed validation"
            );
            validation_response(errors)
        }
        RelayError::Configuration(message) => {
            tracing::error!(
                event = "relay_misconfigured",
                error = %message,
                "relay endpoint is misconfigured"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(NotificationResult::failed(format!(
                    "Configuration error: {message}"
                ))),
            )
                .into_response()
        }
        RelayError::Delivery(err) => {
            tracing::error!(
                event = "relay_delivery_failed",
                kind = kind.label(),
                chat_id = %chat_id,
                error = %err,
                "error sending {}",
                kind.label()
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(NotificationResult::failed(format!(
                    "Failed to send {}: {err}",
                    kind.label()
                ))),
            )
                .into_response()
        }
    }
}

fn validation_response(errors: ValidationErrors) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ValidationProblem {
            title: "One or more validation errors occurred.".to_string(),
            status: StatusCode::BAD_REQUEST.as_u16(),
            errors,
        }),
    )
        .into_response()
}

/// Channel webhook: authenticates the Bot Framework token, then hands the
/// activity to the backend's protocol handler.
pub async fn inbound_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(validator) = state.channel_validator.as_ref() else {
        tracing::error!(event = "channel_misconfigured", "bot app id is not configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_body("bot app id is not configured")),
        )
            .into_response();
    };
    let token = match crate::identity::validator::bearer_token(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
    ) {
        Ok(token) => token,
        Err(err) => return reject(err),
    };
    if let Err(err) = validator.validate(token).await {
        return reject(err);
    }

    let activity: Activity = match serde_json::from_slice(&body) {
        Ok(activity) => activity,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_body(&format!("invalid activity: {err}"))),
            )
                .into_response();
        }
    };
    tracing::info!(
        event = "inbound_activity",
        kind = %activity.kind,
        channel_id = activity.channel_id.as_deref().unwrap_or("unknown"),
        "inbound activity received"
    );
    match state
        .backend
        .process_activity(activity, state.bot_handler.as_ref())
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(event = "inbound_activity_failed", error = %err, "activity processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_body(&err.to_string())),
            )
                .into_response()
        }
    }
}

/// The channel protocol only accepts POST.
pub async fn inbound_get() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
    )
        .into_response()
}

fn error_body(message: &str) -> BTreeMap<&'static str, String> {
    BTreeMap::from([("error", message.to_string())])
}
