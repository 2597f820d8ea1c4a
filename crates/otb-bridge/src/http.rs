//! Operator HTTP/JSON API
//!
//! The UI consumes these endpoints; the bridge never calls back into the UI.
//! All responses are JSON; errors use the `{error, message}` envelope with
//! the taxonomy reason as `error`. When `web_ui.auth.enabled` is set, every
//! request must carry an `Authorization` header (token verification itself
//! belongs to the external auth layer) or it is rejected with 401.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use otb_core::{BridgeError, SourceSpec, ZerobusSpec};

use crate::bridge::Bridge;
use crate::discovery::ProbeRequest;

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
    auth_enabled: bool,
}

/// Build the `/api` router for a bridge
pub fn router(bridge: Arc<Bridge>) -> Router {
    let state = AppState {
        auth_enabled: bridge.web_ui_spec().auth.enabled,
        bridge,
    };
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/metrics", get(get_metrics))
        .route("/api/diagnostics/pipeline", get(get_pipeline))
        .route("/api/sources", get(get_sources).post(post_source))
        .route("/api/sources/:name", put(put_source).delete(delete_source))
        .route("/api/sources/:name/start", post(start_source))
        .route("/api/sources/:name/stop", post(stop_source))
        .route("/api/bridge/start", post(start_bridge))
        .route("/api/bridge/stop", post(stop_bridge))
        .route(
            "/api/zerobus/config",
            get(get_zerobus_config).post(post_zerobus_config),
        )
        .route("/api/zerobus/start", post(start_zerobus))
        .route("/api/zerobus/stop", post(stop_zerobus))
        .route("/api/zerobus/diagnostics", get(get_zerobus_diagnostics))
        .route("/api/discovery/scan", post(discovery_scan))
        .route("/api/discovery/servers", get(discovery_servers))
        .route("/api/discovery/test", post(discovery_test))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if state.auth_enabled && !request.headers().contains_key("authorization") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "auth_failed", "message": "authentication required"})),
        )
            .into_response();
    }
    next.run(request).await
}

/// `{error, message}` envelope carrying the taxonomy reason
struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::ConfigInvalid(_)
            | BridgeError::TargetInvalid(_)
            | BridgeError::SchemaMismatch(_) => StatusCode::BAD_REQUEST,
            BridgeError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            BridgeError::QueueFull
            | BridgeError::SpoolFull
            | BridgeError::BreakerOpen
            | BridgeError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::NetworkUnreachable(_)
            | BridgeError::TlsFailed(_)
            | BridgeError::ProtocolError(_) => StatusCode::BAD_GATEWAY,
            BridgeError::SpoolCorrupt(_)
            | BridgeError::SpoolLocked(_)
            | BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.reason(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.status().await)
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.metrics().await)
}

async fn get_pipeline(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.diagnostics_pipeline())
}

async fn get_sources(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.sources().await)
}

async fn post_source(
    State(state): State<AppState>,
    Json(spec): Json<SourceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    state.bridge.add_source(spec.clone()).await?;
    Ok((StatusCode::CREATED, Json(spec)))
}

async fn put_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(spec): Json<SourceSpec>,
) -> Result<impl IntoResponse, ApiError> {
    state.bridge.update_source(&name, spec.clone()).await?;
    Ok(Json(spec))
}

async fn delete_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.bridge.delete_source(&name).await?;
    Ok(Json(json!({"deleted": name})))
}

async fn start_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.bridge.start_source(&name).await?;
    Ok(Json(json!({"started": name})))
}

async fn stop_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.bridge.stop_source(&name).await?;
    Ok(Json(json!({"stopped": name})))
}

async fn start_bridge(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.bridge.start_bridge().await?;
    Ok(Json(json!({"running": true})))
}

async fn stop_bridge(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.bridge.stop_bridge().await?;
    Ok(Json(json!({"running": false})))
}

async fn get_zerobus_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.zerobus_config().await)
}

async fn post_zerobus_config(
    State(state): State<AppState>,
    Json(spec): Json<ZerobusSpec>,
) -> Result<impl IntoResponse, ApiError> {
    state.bridge.set_zerobus_config(spec).await?;
    Ok(Json(json!({"updated": true})))
}

async fn start_zerobus(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.bridge.start_zerobus().await?;
    Ok(Json(json!({"zerobus": "started"})))
}

async fn stop_zerobus(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.bridge.stop_zerobus().await;
    Ok(Json(json!({"zerobus": "stopped"})))
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    #[serde(default)]
    deep: bool,
}

async fn get_zerobus_diagnostics(
    State(state): State<AppState>,
    Query(query): Query<DiagnosticsQuery>,
) -> impl IntoResponse {
    Json(state.bridge.zerobus_diagnostics(query.deep).await)
}

async fn discovery_scan(
    State(state): State<AppState>,
    Json(request): Json<ProbeRequest>,
) -> impl IntoResponse {
    Json(state.bridge.discovery().scan(request).await)
}

async fn discovery_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.bridge.discovery().servers())
}

async fn discovery_test(
    State(state): State<AppState>,
    Json(request): Json<ProbeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoint = request
        .endpoints
        .first()
        .ok_or_else(|| BridgeError::ConfigInvalid("no endpoint to test".into()))?;
    let result = state
        .bridge
        .discovery()
        .probe(request.protocol_type, endpoint, request.credentials_ref.clone())
        .await;
    Ok(Json(result))
}
