use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{CorsConfig, DEFAULT_BIND};
use crate::server::middleware::require_app_role;
use crate::server::routes;
use crate::server::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/teamsmessage/send", post(routes::send))
        .route("/api/teamsmessage/send-card", post(routes::send_card))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_app_role));

    let mut app = Router::new()
        .route("/api/teamsmessage/get", get(routes::ready))
        .route("/api/teamsmessage/health", get(routes::health))
        .route(
            "/api/teamsmessage",
            post(routes::inbound_activity).get(routes::inbound_get),
        )
        .merge(protected)
        .with_state(state.clone());

    let cors_layer = build_cors_layer(state.server_config.cors.as_ref());
    let request_timeout = Duration::from_secs(state.server_config.request_timeout_secs());

    app = app.layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(
                state.server_config.max_body_bytes(),
            ))
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                request_timeout,
            )),
    );
    app = app.layer(cors_layer);

    app
}

pub fn bind_address(state: &AppState) -> SocketAddr {
    let fallback = || {
        DEFAULT_BIND
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 3978)))
    };
    state.server_config.bind().parse().unwrap_or_else(|_| {
        tracing::warn!(
            event = "invalid_bind",
            bind = %state.server_config.bind(),
            "invalid bind address, using default"
        );
        fallback()
    })
}

fn build_cors_layer(config: Option<&CorsConfig>) -> CorsLayer {
    let Some(config) = config else {
        return CorsLayer::new().allow_origin(Any);
    };
    if config.allowed_origins.is_empty() {
        return CorsLayer::new().allow_origin(Any);
    }
    let origins = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect::<Vec<_>>();
    CorsLayer::new().allow_origin(origins)
}
