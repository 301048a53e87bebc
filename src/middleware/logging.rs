//! Request log hook, installed as the outermost pipeline stage.
//!
//! Fires on response completion regardless of which stage produced the
//! response, so rejected requests are recorded just like admitted ones. Each
//! request gets an `X-Request-Id` (propagated when the client supplies one),
//! a wall-clock response-time measurement, and an identity taken from the
//! [`RequestContext`] the auth stage attached to the response, falling back
//! to the client IP for anonymous or rejected requests.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;

use super::auth::RequestContext;
use super::ip::client_ip;
use crate::analytics::{Analytics, RequestLog};
use crate::logging::FileLogger;
use crate::metrics;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct RequestLogLayer {
    analytics: Arc<Analytics>,
    file_logger: Option<Arc<FileLogger>>,
}

impl RequestLogLayer {
    pub fn new(analytics: Arc<Analytics>, file_logger: Option<Arc<FileLogger>>) -> Self {
        Self {
            analytics,
            file_logger,
        }
    }
}

impl<S> Layer<S> for RequestLogLayer {
    type Service = RequestLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLogService {
            inner,
            analytics: self.analytics.clone(),
            file_logger: self.file_logger.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestLogService<S> {
    inner: S,
    analytics: Arc<Analytics>,
    file_logger: Option<Arc<FileLogger>>,
}

impl<S> Service<Request<Body>> for RequestLogService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let analytics = self.analytics.clone();
        let file_logger = self.file_logger.clone();
        let mut inner = self.inner.clone();

        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let ip = client_ip(req.headers()).into_owned();
        let request_id = extract_or_generate_request_id(&req);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            let response_time = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            let status = response.status().as_u16();

            let context = response.extensions().get::<RequestContext>().cloned();
            let (client_id, api_key, authenticated) = match context {
                Some(ctx) => (ctx.client_id, ctx.api_key, ctx.authenticated),
                None => (ip.clone(), None, false),
            };

            let record = RequestLog {
                timestamp: chrono::Utc::now().timestamp_millis(),
                method,
                path,
                status_code: status,
                response_time,
                client_id,
                ip,
                api_key,
                authenticated,
            };

            debug!(
                method = %record.method,
                path = %record.path,
                status,
                response_time_ms = response_time,
                client_id = %record.client_id,
                "request completed"
            );
            metrics::record_request(&record.method, status, response_time);
            if let Some(logger) = &file_logger {
                logger.log(&record, &request_id);
            }
            analytics.record(record);

            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

/// Propagate a client-supplied `X-Request-Id` or mint a UUIDv4.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> String {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = value.to_str()
        && !value.is_empty()
    {
        return value.to_string();
    }
    Uuid::new_v4().to_string()
}
