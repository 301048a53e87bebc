//! Admission-control middleware over the rate-limiting engine.
//!
//! Consults the engine with the client IP and the tier resolved by the
//! authentication stage, emits the `X-RateLimit-*` headers whenever a finite
//! limit applied, and rejects exhausted clients with
//! `{"error":"Rate limit exceeded","retryAfter":<seconds>}`.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use super::auth::RequestContext;
use super::ip::client_ip;
use crate::error::GatewayError;
use crate::limiter::{Decision, RateLimiter};
use crate::metrics;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ip = client_ip(req.headers()).into_owned();
            let tier = req
                .extensions()
                .get::<RequestContext>()
                .map(|ctx| ctx.tier.clone())
                .unwrap_or_else(|| limiter.config().default_tier.clone());

            let decision = limiter.check(&ip, &tier);

            if decision.allowed {
                let mut response = inner.call(req).await?;
                apply_headers(&mut response, &decision);
                Ok(response)
            } else {
                let retry_after_secs = retry_after_secs(&decision);
                warn!(
                    ip = %ip,
                    tier = %tier,
                    path = %req.uri().path(),
                    retry_after_secs,
                    "request rejected by rate limiter"
                );
                metrics::record_rate_limit_hit();
                let mut response =
                    GatewayError::RateLimited { retry_after_secs }.into_response();
                apply_headers(&mut response, &decision);
                Ok(response)
            }
        })
    }
}

/// Seconds a rejected client should wait; never advertises zero.
fn retry_after_secs(decision: &Decision) -> u64 {
    (decision.reset_ms.max(0) as u64).div_ceil(1000).max(1)
}

/// Emit rate-limit headers. Skipped for unlimited tiers (`limit <= 0`).
fn apply_headers(response: &mut Response<Body>, decision: &Decision) {
    if decision.limit <= 0 {
        return;
    }
    let headers = response.headers_mut();
    insert_numeric(headers, LIMIT_HEADER, decision.limit);
    insert_numeric(headers, REMAINING_HEADER, decision.remaining.max(0));
    insert_numeric(
        headers,
        RESET_HEADER,
        (decision.reset_ms.max(0) + 999) / 1000,
    );
}

fn insert_numeric(headers: &mut axum::http::HeaderMap, name: &'static str, value: i64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn response() -> Response<Body> {
        Response::new(Body::empty())
    }

    #[test]
    fn headers_applied_for_finite_limits() {
        let mut resp = response();
        apply_headers(
            &mut resp,
            &Decision {
                allowed: true,
                remaining: 4,
                reset_ms: 2_500,
                limit: 5,
            },
        );
        assert_eq!(resp.headers()[LIMIT_HEADER], "5");
        assert_eq!(resp.headers()[REMAINING_HEADER], "4");
        assert_eq!(resp.headers()[RESET_HEADER], "3");
    }

    #[test]
    fn remaining_clamps_at_zero() {
        let mut resp = response();
        apply_headers(
            &mut resp,
            &Decision {
                allowed: false,
                remaining: -3,
                reset_ms: 0,
                limit: 5,
            },
        );
        assert_eq!(resp.headers()[REMAINING_HEADER], "0");
        assert_eq!(resp.headers()[RESET_HEADER], "0");
    }

    #[test]
    fn unlimited_tier_emits_no_headers() {
        let mut resp = response();
        apply_headers(
            &mut resp,
            &Decision {
                allowed: true,
                remaining: -1,
                reset_ms: 0,
                limit: -1,
            },
        );
        assert!(resp.headers().get(LIMIT_HEADER).is_none());
        assert!(resp.headers().get(REMAINING_HEADER).is_none());
        assert!(resp.headers().get(RESET_HEADER).is_none());
    }

    #[test]
    fn retry_after_rounds_up_and_floors_at_one() {
        let d = |reset_ms| Decision {
            allowed: false,
            remaining: 0,
            reset_ms,
            limit: 5,
        };
        assert_eq!(retry_after_secs(&d(1)), 1);
        assert_eq!(retry_after_secs(&d(1_000)), 1);
        assert_eq!(retry_after_secs(&d(1_001)), 2);
        assert_eq!(retry_after_secs(&d(0)), 1);
    }
}
