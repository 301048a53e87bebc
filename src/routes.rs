//! Router assembly and middleware composition.
//!
//! Application routes (supplied by the embedding binary) and the device
//! registration endpoint pass the full admission pipeline. The management
//! surface and the health endpoint skip only the rate-limiter stage, so the
//! dashboard stays reachable while the gateway is rejecting traffic; the log
//! hook, authentication, and IP filter still apply to them.

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{AuthLayer, IpFilterLayer, RateLimitLayer, RequestLogLayer};
use crate::state::AppState;

/// Wrap `app`'s routes in the admission pipeline and attach the gateway's
/// own surfaces.
pub fn build_router(state: AppState, app: Router<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.cors_allowed_origins);

    // Full pipeline: log hook -> auth -> IP filter -> rate limit -> handler.
    let limited = app
        .route("/auth/device/register", post(handlers::register_device))
        .layer(RateLimitLayer::new(state.limiter.clone()));

    let management = Router::new()
        .route("/admin/analytics", get(handlers::analytics_snapshot))
        .route("/admin/analytics/stream", get(handlers::analytics_stream))
        .route("/admin/config", get(handlers::read_config))
        .route("/admin/keys", post(handlers::create_key))
        .route("/admin/keys/{id}", delete(handlers::revoke_key))
        .route("/admin/devices/{browser_id}", delete(handlers::revoke_device))
        .route("/admin/logs", get(handlers::recent_logs));

    info!(
        default_tier = %state.config.rate_limits.default_tier,
        global_max = state.config.rate_limits.global_limit.max_requests,
        ip_mode = ?state.ip_rules.mode,
        "admission pipeline configured"
    );

    limited
        .merge(management)
        .route("/health", get(handlers::health))
        .layer(IpFilterLayer::new(state.ip_rules.clone()))
        .layer(AuthLayer::new(
            state.credentials.clone(),
            Some(state.devices.clone()),
        ))
        .layer(RequestLogLayer::new(
            state.analytics.clone(),
            state.file_logger.clone(),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build CORS layer from configuration.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
