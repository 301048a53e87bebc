//! Identity resolution middleware.
//!
//! Resolves each request into `(client_id, tier)` from either a static
//! `gw_live_` credential or a `totp_` device key, and attaches the result as
//! a [`RequestContext`] on both the request (for downstream stages) and the
//! response (for the log hook). Requests without a key pass through as
//! anonymous, keyed by client IP on the `free` tier. This stage never writes
//! rate-limit headers; it only rejects invalid credentials with 401 bodies
//! shaped `{"error": <reason>}`.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use chrono::Utc;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::client_ip;
use crate::credentials::CredentialStore;
use crate::devices::DeviceRegistry;
use crate::error::GatewayError;
use crate::metrics;
use crate::totp;

/// Header examined first for the credential candidate.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter examined second.
pub const API_KEY_QUERY: &str = "apiKey";

/// Tier assigned to anonymous and TOTP-authenticated clients.
pub const ANONYMOUS_TIER: &str = "free";

/// Request-scoped identity produced by this stage.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_id: String,
    pub tier: String,
    /// Raw credential value as presented, when one authenticated.
    pub api_key: Option<String>,
    pub authenticated: bool,
}

impl RequestContext {
    pub fn anonymous(ip: &str) -> Self {
        Self {
            client_id: ip.to_string(),
            tier: ANONYMOUS_TIER.to_string(),
            api_key: None,
            authenticated: false,
        }
    }
}

/// Authentication layer. The device registry is optional; without one,
/// `totp_` keys fall through to the static-credential path.
#[derive(Clone)]
pub struct AuthLayer {
    credentials: Arc<CredentialStore>,
    devices: Option<Arc<DeviceRegistry>>,
}

impl AuthLayer {
    pub fn new(credentials: Arc<CredentialStore>, devices: Option<Arc<DeviceRegistry>>) -> Self {
        Self {
            credentials,
            devices,
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            credentials: self.credentials.clone(),
            devices: self.devices.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    credentials: Arc<CredentialStore>,
    devices: Option<Arc<DeviceRegistry>>,
}

impl<S> Service<Request<Body>> for AuthService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let credentials = self.credentials.clone();
        let devices = self.devices.clone();
        let mut inner = self.inner.clone();
        let ip = client_ip(req.headers()).into_owned();

        Box::pin(async move {
            let candidate = extract_api_key(&req);

            let context = match candidate {
                None => RequestContext::anonymous(&ip),
                Some(key) => {
                    match resolve_key(&key, &ip, &credentials, devices.as_deref()).await {
                        Ok(context) => context,
                        Err(err) => {
                            warn!(ip = %ip, path = %req.uri().path(), error = %err, "authentication rejected");
                            metrics::record_auth_failure();
                            let mut response = err.into_response();
                            // The log hook still needs an identity for the
                            // rejected request.
                            response
                                .extensions_mut()
                                .insert(RequestContext::anonymous(&ip));
                            return Ok(response);
                        }
                    }
                }
            };

            debug!(client_id = %context.client_id, tier = %context.tier, "identity resolved");
            req.extensions_mut().insert(context.clone());
            let mut response = inner.call(req).await?;
            response.extensions_mut().insert(context);
            Ok(response)
        })
    }
}

/// Resolve a presented key into an identity, or the 401 that rejects it.
async fn resolve_key(
    key: &str,
    ip: &str,
    credentials: &CredentialStore,
    devices: Option<&DeviceRegistry>,
) -> Result<RequestContext, GatewayError> {
    if key.starts_with(totp::TOTP_PREFIX)
        && let Some(registry) = devices
    {
        let Some((browser_id, code)) = totp::parse_key(key) else {
            return Err(GatewayError::Unauthorized("Malformed TOTP key".to_string()));
        };
        let Some(device) = registry.get(browser_id).await else {
            return Err(GatewayError::Unauthorized(
                "Device not registered or expired".to_string(),
            ));
        };
        if !totp::validate_code(
            browser_id,
            &device.shared_secret,
            code,
            Utc::now().timestamp_millis(),
        ) {
            return Err(GatewayError::Unauthorized("Invalid TOTP code".to_string()));
        }
        registry.touch(browser_id, ip).await;
        return Ok(RequestContext {
            client_id: browser_id.to_string(),
            tier: ANONYMOUS_TIER.to_string(),
            api_key: Some(key.to_string()),
            authenticated: true,
        });
    }

    match credentials.authenticate(key) {
        Some(credential) => Ok(RequestContext {
            client_id: credential.id,
            tier: credential.tier,
            api_key: Some(key.to_string()),
            authenticated: true,
        }),
        None => Err(GatewayError::Unauthorized(
            "Invalid or revoked API key".to_string(),
        )),
    }
}

/// First non-empty of the `X-API-Key` header and the `apiKey` query param.
fn extract_api_key<B>(req: &Request<B>) -> Option<String> {
    if let Some(value) = req.headers().get(API_KEY_HEADER)
        && let Ok(value) = value.to_str()
        && !value.is_empty()
    {
        return Some(value.to_string());
    }

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some((name, value)) = pair.split_once('=')
                && name == API_KEY_QUERY
                && !value.is_empty()
            {
                return Some(value.to_string());
            }
        }
    }

    None
}
