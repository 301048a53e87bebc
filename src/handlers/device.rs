//! Device registration endpoint for TOTP clients.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::metrics;
use crate::middleware::client_ip;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest {
    pub browser_id: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceResponse {
    pub browser_id: String,
    pub shared_secret: String,
    pub expires_at: i64,
}

/// `POST /auth/device/register`
///
/// Binds a browser-generated UUIDv4 to a freshly issued shared secret, or
/// refreshes the lifetime of an already-registered device (returning the
/// same secret). Velocity and per-IP device caps are enforced by the
/// registry itself.
pub async fn register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterDeviceRequest>,
) -> GatewayResult<Json<RegisterDeviceResponse>> {
    let browser_id = body.browser_id.trim();
    if Uuid::parse_str(browser_id).is_err() {
        return Err(GatewayError::BadRequest(
            "browserId must be a UUID".to_string(),
        ));
    }

    let ip = client_ip(&headers).into_owned();
    let user_agent = body
        .user_agent
        .or_else(|| {
            headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let entry = state
        .devices
        .register(browser_id, &ip, &user_agent)
        .await?;
    metrics::record_device_registration();
    metrics::set_active_devices(state.devices.live_count().await);
    info!(browser_id = %entry.browser_id, ip = %ip, "device registered");

    Ok(Json(RegisterDeviceResponse {
        browser_id: entry.browser_id,
        shared_secret: entry.shared_secret,
        expires_at: entry.expires_at,
    }))
}
