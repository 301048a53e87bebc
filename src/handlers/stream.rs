//! Live analytics feed over Server-Sent Events.
//!
//! Each subscriber gets an independent producer that emits the current
//! snapshot immediately and every five seconds thereafter as a
//! `data: <json>` frame. Dropping the connection drops the stream and its
//! interval with it; other subscribers are unaffected.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use tracing::error;

use crate::state::AppState;

/// Emission cadence.
pub const SSE_INTERVAL_MS: u64 = 5_000;

/// `GET /admin/analytics/stream`
pub async fn analytics_stream(State(state): State<AppState>) -> Response {
    let mut response = Sse::new(snapshot_stream(state))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();

    // Defeat proxy buffering so frames reach the dashboard as they are cut.
    let headers = response.headers_mut();
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    response
}

fn snapshot_stream(state: AppState) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut ticker = tokio::time::interval(Duration::from_millis(SSE_INTERVAL_MS));
        loop {
            // The first tick completes immediately, so subscribers see a
            // snapshot on connect.
            ticker.tick().await;
            match serde_json::to_string(&state.analytics.snapshot()) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => error!(error = %e, "failed to serialize analytics snapshot"),
            }
        }
    }
}
