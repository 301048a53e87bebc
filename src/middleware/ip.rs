//! Client IP resolution shared by every pipeline stage.
//!
//! The gateway keys limiter state, the IP filter, device caps, and analytics
//! by the client address, resolved from proxy headers in priority order.
//! These headers are client-controlled unless the gateway sits behind a
//! trusted reverse proxy that overwrites them; deploy accordingly.

use std::borrow::Cow;

use axum::http::HeaderMap;

/// Fallback key when no client IP can be determined. Requests without
/// identifiable addresses share one limiter bucket.
pub const UNKNOWN_IP: &str = "unknown";

/// Resolve the client IP from request headers.
///
/// Priority: first entry of `X-Forwarded-For`, then `X-Real-IP`, then
/// [`UNKNOWN_IP`]. Returns a borrowed value for the fallback so the hot path
/// does not allocate.
#[inline]
pub fn client_ip(headers: &HeaderMap) -> Cow<'static, str> {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        return Cow::Owned(first.trim().to_string());
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return Cow::Owned(value.trim().to_string());
    }

    Cow::Borrowed(UNKNOWN_IP)
}
