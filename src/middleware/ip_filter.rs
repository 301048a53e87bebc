//! IP allow/block filtering middleware.
//!
//! Runs after identity resolution and before admission control. The verdict
//! is a pure function of the rule set and the resolved client IP, so repeated
//! application to the same request always yields the same answer.

use std::collections::HashSet;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use serde::Serialize;
use tower::{Layer, Service};
use tracing::warn;

use super::ip::client_ip;
use crate::error::GatewayError;

/// Filtering discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterMode {
    /// Only listed IPs pass (when the list is non-empty).
    Allowlist,
    /// Listed IPs are rejected.
    Blocklist,
}

/// The rule set. Empty lists are no-ops in either mode.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRules {
    pub allowlist: HashSet<String>,
    pub blocklist: HashSet<String>,
    pub mode: FilterMode,
}

impl Default for IpRules {
    fn default() -> Self {
        Self {
            allowlist: HashSet::new(),
            blocklist: HashSet::new(),
            mode: FilterMode::Blocklist,
        }
    }
}

impl IpRules {
    /// Returns the rejection reason, or `None` when the IP passes.
    pub fn verdict(&self, ip: &str) -> Option<&'static str> {
        match self.mode {
            FilterMode::Allowlist => {
                if !self.allowlist.is_empty() && !self.allowlist.contains(ip) {
                    Some("IP not in allowlist")
                } else {
                    None
                }
            }
            FilterMode::Blocklist => {
                if self.blocklist.contains(ip) {
                    Some("IP is blocked")
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct IpFilterLayer {
    rules: Arc<IpRules>,
}

impl IpFilterLayer {
    pub fn new(rules: Arc<IpRules>) -> Self {
        Self { rules }
    }
}

impl<S> Layer<S> for IpFilterLayer {
    type Service = IpFilterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IpFilterService {
            inner,
            rules: self.rules.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IpFilterService<S> {
    inner: S,
    rules: Arc<IpRules>,
}

impl<S> Service<Request<Body>> for IpFilterService<S>
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
        let rules = self.rules.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ip = client_ip(req.headers());
            if let Some(reason) = rules.verdict(&ip) {
                warn!(ip = %ip, reason, "request blocked by IP filter");
                return Ok(GatewayError::Forbidden(reason.to_string()).into_response());
            }
            inner.call(req).await
        })
    }
}
