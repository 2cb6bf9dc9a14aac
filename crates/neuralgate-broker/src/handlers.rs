//! HTTP request handlers

use axum::{
    body::to_bytes,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::access::canonical_ip;
use crate::dispatcher::Passthrough;
use crate::error::GatewayError;
use crate::ingress::{parse_json_body, source_ip};
use crate::server::AppState;
use crate::verifier::{bearer_token, bounded};

/// Source IP recorded when the peer address is unavailable
const UNKNOWN_IP: &str = "unknown";

#[derive(Debug, Deserialize)]
pub struct PassthroughPath {
    pub username: String,
    pub slug: String,
    #[serde(default)]
    pub subpath: String,
}

/// `ANY /users/{username}/{slug}/{*subpath}`
pub async fn passthrough(
    State(state): State<Arc<AppState>>,
    Path(path): Path<PassthroughPath>,
    request: Request,
) -> Response {
    match forward(&state, path, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward(
    state: &AppState,
    path: PassthroughPath,
    request: Request,
) -> Result<Response, GatewayError> {
    let api_key = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .unwrap_or_default()
        .to_string();

    let verified = state
        .verifier
        .verify(&path.username, &path.slug, &api_key)
        .await?;

    let ip = source_ip(&request, state.config.trust_proxy)
        .map(canonical_ip)
        .unwrap_or_else(|| UNKNOWN_IP.to_string());
    state.access.authorize(verified.client_id, &ip).await?;

    let method = request.method().to_string();
    let bytes = to_bytes(request.into_body(), state.config.body_limit)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge)?;
    let body = parse_json_body(&bytes)?;

    let relayed = state
        .dispatcher
        .dispatch(Passthrough {
            identity: verified.identity,
            client_id: verified.client_id,
            method,
            subpath: path.subpath,
            body,
        })
        .await?;

    let status = StatusCode::from_u16(relayed.status)
        .map_err(|e| GatewayError::BadGateway(e.to_string()))?;
    Ok((status, Json(relayed.data)).into_response())
}

/// Hardware summary posted by agents
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub username: String,
    pub slug: String,
    pub api_key: String,
    #[serde(default)]
    pub specs: Value,
    /// Agent process uptime in seconds
    #[serde(default)]
    pub uptime: f64,
}

/// `POST /api/report-stats`
pub async fn report_stats(
    State(state): State<Arc<AppState>>,
    Json(report): Json<StatsReport>,
) -> Result<Json<Value>, GatewayError> {
    let verified = state
        .verifier
        .verify(&report.username, &report.slug, &report.api_key)
        .await?;

    let uptime_secs = report.uptime.max(0.0).round() as i64;
    bounded(
        state.config.lookup_timeout,
        state
            .store
            .report_hardware(verified.client_id, &report.specs.to_string(), uptime_secs),
    )
    .await
    .map_err(|e| {
        warn!(identity = %verified.identity, error = %e, "Failed to store hardware report");
        GatewayError::Internal("Failed to log stats".to_string())
    })?;

    info!(identity = %verified.identity, uptime_secs, "Hardware stats reported");
    Ok(Json(json!({ "ok": true })))
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "agents_online": state.registry.online(),
    }))
}
