//! The request-admission pipeline.
//!
//! Stages run in a fixed order, each able to short-circuit with a structured
//! JSON error while the log hook still records the outcome:
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │    Log hook      │ ← records on response completion, any outcome
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Authentication  │ ← 401 on invalid key; anonymous passes through
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    IP filter     │ ← 403 by allowlist/blocklist rules
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Rate limiter   │ ← 429 + X-RateLimit-* headers
//! └────────┬─────────┘
//!          ▼
//!       Handler
//! ```
//!
//! The management surface skips only the rate-limiter stage so the dashboard
//! stays reachable while the gateway is saturated.

pub mod auth;
pub mod ip;
pub mod ip_filter;
pub mod logging;
pub mod rate_limit;

pub use auth::{AuthLayer, RequestContext};
pub use ip::{UNKNOWN_IP, client_ip};
pub use ip_filter::{FilterMode, IpFilterLayer, IpRules};
pub use logging::{REQUEST_ID_HEADER, RequestLogLayer};
pub use rate_limit::RateLimitLayer;
