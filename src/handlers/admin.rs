//! Management surface: analytics reads, configuration, credential and device
//! administration, paginated request logs.
//!
//! These endpoints bypass the rate limiter so observability survives
//! saturation; the log hook still records every call.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::analytics::{AnalyticsSnapshot, RequestLog};
use crate::credentials::Credential;
use crate::error::{GatewayError, GatewayResult};
use crate::middleware::auth::ANONYMOUS_TIER;
use crate::state::AppState;

/// `GET /admin/analytics`: current snapshot.
pub async fn analytics_snapshot(State(state): State<AppState>) -> Json<AnalyticsSnapshot> {
    Json(state.analytics.snapshot())
}

/// `GET /admin/config`: effective admission configuration.
pub async fn read_config(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.analytics.snapshot();
    Json(json!({
        "rateLimits": state.limiter.config(),
        "ipRules": state.ip_rules.as_ref(),
        "activeKeys": state.credentials.active_count(),
        "activeKeyUses": snapshot.active_key_uses,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: Option<String>,
    pub tier: Option<String>,
}

/// `POST /admin/keys`: mint a credential. The secret is returned exactly
/// once, in this response.
pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> GatewayResult<(StatusCode, Json<Credential>)> {
    let name = body
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("Missing key name".to_string()))?;
    let tier = body.tier.as_deref().unwrap_or(ANONYMOUS_TIER);

    let credential = state.credentials.create(name, tier);
    info!(id = %credential.id, tier, "credential created");
    Ok((StatusCode::CREATED, Json(credential)))
}

/// `DELETE /admin/keys/{id}`: revoke a credential.
pub async fn revoke_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> GatewayResult<Json<Value>> {
    if !state.credentials.revoke(&id) {
        return Err(GatewayError::NotFound(format!("No such key: {id}")));
    }
    info!(id = %id, "credential revoked");
    Ok(Json(json!({ "id": id })))
}

/// `DELETE /admin/devices/{browser_id}`: revoke a registered device.
pub async fn revoke_device(
    State(state): State<AppState>,
    Path(browser_id): Path<String>,
) -> GatewayResult<Json<Value>> {
    if !state.devices.revoke(&browser_id).await {
        return Err(GatewayError::NotFound(format!(
            "No such device: {browser_id}"
        )));
    }
    info!(browser_id = %browser_id, "device revoked");
    Ok(Json(json!({ "browserId": browser_id })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<RequestLog>,
    pub limit: usize,
    pub offset: usize,
}

/// `GET /admin/logs?limit=20&offset=0`: newest-first page of the buffer.
pub async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Json<LogsResponse> {
    let limit = query.limit.unwrap_or(20);
    let offset = query.offset.unwrap_or(0);
    Json(LogsResponse {
        logs: state.analytics.recent(limit, offset),
        limit,
        offset,
    })
}
