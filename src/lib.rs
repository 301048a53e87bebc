//! # apigate
//!
//! An in-process API gateway that fronts an HTTP application with per-client
//! admission control, identity resolution, and live observability. Built for
//! single-instance deployments: all admission state lives in memory, resets
//! on restart, and needs no external coordination store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline (Log hook → Auth → IP filter → Rate limit)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Application routes      │  Management surface (no limiter) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Engines: limiter, credentials, device registry, analytics  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Maintenance: debounced persistence, hourly expiry sweep    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use apigate::{AppState, Config, build_router};
//! use axum::{Router, routing::get};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config).await;
//!
//!     let app = Router::new().route("/api/hello", get(|| async { "hello" }));
//!     let router = build_router(state, app);
//!
//!     // Serve the router...
//!     Ok(())
//! }
//! ```

pub mod analytics;
pub mod config;
pub mod credentials;
pub mod devices;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod totp;

// Re-exports for convenience
pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use routes::build_router;
pub use state::AppState;
