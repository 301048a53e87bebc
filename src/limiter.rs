//! Rate-limiting engine: three per-tier algorithms plus a global ceiling.
//!
//! # Algorithms
//!
//! - **Token bucket**: smooth refill at `refill_rate` tokens/second, burst up
//!   to `max_requests`. 16 bytes of state per client.
//! - **Sliding-window log**: exact request-count accuracy over a rolling
//!   window, `O(max_requests)` memory per client.
//! - **Fixed window**: cheapest counter with the known up-to-2x burst at
//!   window edges. Used for the global ceiling.
//!
//! # Failure semantics
//!
//! The engine fails open: an unresolvable tier, malformed parameters, or a
//! poisoned state lock admit the request with the "unlimited" sentinel
//! (`remaining = -1, limit = -1`) instead of rejecting.
//!
//! # Clock
//!
//! All arithmetic runs on a monotonic millisecond clock anchored at engine
//! creation; a backward wall-clock jump can never produce negative elapsed
//! time. Tests drive the deterministic `check_at` entry point directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Sentinel key for the global fixed-window counter.
const GLOBAL_KEY: &str = "__global__";

/// Per-tier limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    /// Disables per-tier limiting; the global ceiling still applies.
    None,
}

/// A named rate-limit policy assigned to a credential tier.
///
/// `token_bucket` requires `max_requests` and `refill_rate`; the windowed
/// algorithms require `max_requests` and `window_ms`. A tier that fails
/// validation is treated as unlimited at check time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub algorithm: Algorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refill_rate: Option<f64>,
}

impl Tier {
    pub fn token_bucket(max_requests: u32, refill_rate: f64) -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            max_requests: Some(max_requests),
            window_ms: None,
            refill_rate: Some(refill_rate),
        }
    }

    pub fn sliding_window(max_requests: u32, window_ms: i64) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            max_requests: Some(max_requests),
            window_ms: Some(window_ms),
            refill_rate: None,
        }
    }

    pub fn fixed_window(max_requests: u32, window_ms: i64) -> Self {
        Self {
            algorithm: Algorithm::FixedWindow,
            max_requests: Some(max_requests),
            window_ms: Some(window_ms),
            refill_rate: None,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            algorithm: Algorithm::None,
            max_requests: None,
            window_ms: None,
            refill_rate: None,
        }
    }

    /// Validate parameter presence for the chosen algorithm.
    pub fn validate(&self, name: &str) -> Result<(), String> {
        match self.algorithm {
            Algorithm::TokenBucket => {
                if self.max_requests.is_none() || self.refill_rate.is_none() {
                    return Err(format!(
                        "tier '{name}': tokenBucket requires maxRequests and refillRate"
                    ));
                }
            }
            Algorithm::SlidingWindow | Algorithm::FixedWindow => {
                if self.max_requests.is_none() || self.window_ms.is_none() {
                    return Err(format!(
                        "tier '{name}': windowed algorithms require maxRequests and windowMs"
                    ));
                }
            }
            Algorithm::None => {}
        }
        Ok(())
    }
}

/// Process-wide fixed-window ceiling applied before any tier check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalLimit {
    pub max_requests: u32,
    pub window_ms: i64,
}

/// Full limiter configuration: tier table, default tier, global ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub tiers: HashMap<String, Tier>,
    pub default_tier: String,
    pub global_limit: GlobalLimit,
}

impl RateLimitConfig {
    /// Validate the `default_tier ∈ tiers` invariant and each tier's params.
    pub fn validate(&self) -> Result<(), String> {
        if !self.tiers.contains_key(&self.default_tier) {
            return Err(format!(
                "defaultTier '{}' is not present in the tier table",
                self.default_tier
            ));
        }
        for (name, tier) in &self.tiers {
            tier.validate(name)?;
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert("free".to_string(), Tier::token_bucket(60, 1.0));
        tiers.insert("premium".to_string(), Tier::sliding_window(600, 60_000));
        tiers.insert("enterprise".to_string(), Tier::fixed_window(3_000, 60_000));
        tiers.insert("unlimited".to_string(), Tier::unlimited());
        Self {
            tiers,
            default_tier: "free".to_string(),
            global_limit: GlobalLimit {
                max_requests: 10_000,
                window_ms: 60_000,
            },
        }
    }
}

/// Outcome of an admission check.
///
/// `remaining = -1` and `limit = -1` are the "unlimited" sentinels; headers
/// are only emitted when `limit > 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_ms: i64,
    pub limit: i64,
}

impl Decision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: -1,
            reset_ms: 0,
            limit: -1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: i64,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: u32,
    window_start: i64,
}

/// The admission engine. Owns four disjoint client-state maps; unused entries
/// persist until process restart (operators with unbounded client populations
/// should front the gateway with CIDR filtering).
pub struct RateLimiter {
    config: RateLimitConfig,
    origin: Instant,
    buckets: Mutex<HashMap<(String, String), BucketState>>,
    sliding: Mutex<HashMap<(String, String), VecDeque<i64>>>,
    fixed: Mutex<HashMap<(String, String), WindowState>>,
    global: Mutex<HashMap<String, WindowState>>,
    hits: Arc<AtomicU64>,
}

impl RateLimiter {
    /// Create an engine over a validated config. The `hits` counter is shared
    /// with the analytics engine.
    pub fn new(config: RateLimitConfig, hits: Arc<AtomicU64>) -> Self {
        Self {
            config,
            origin: Instant::now(),
            buckets: Mutex::new(HashMap::new()),
            sliding: Mutex::new(HashMap::new()),
            fixed: Mutex::new(HashMap::new()),
            global: Mutex::new(HashMap::new()),
            hits,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Milliseconds since engine creation on the monotonic clock.
    fn now_ms(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    /// Admission check for one request from `ip` under `tier_name`.
    pub fn check(&self, ip: &str, tier_name: &str) -> Decision {
        self.check_at(ip, tier_name, self.now_ms())
    }

    /// Deterministic admission check against an explicit clock reading.
    pub fn check_at(&self, ip: &str, tier_name: &str, now_ms: i64) -> Decision {
        // Global ceiling consumes one unit before any tier is consulted.
        let global = self.check_global(now_ms);
        if !global.allowed {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return global;
        }

        let tier = self
            .config
            .tiers
            .get(tier_name)
            .or_else(|| self.config.tiers.get(&self.config.default_tier));
        let Some(tier) = tier else {
            return Decision::unlimited();
        };

        let decision = match tier.algorithm {
            Algorithm::None => Decision::unlimited(),
            Algorithm::TokenBucket => self.check_token_bucket(tier_name, ip, tier, now_ms),
            Algorithm::SlidingWindow => self.check_sliding_window(tier_name, ip, tier, now_ms),
            Algorithm::FixedWindow => self.check_fixed_window(tier_name, ip, tier, now_ms),
        };
        if !decision.allowed {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    fn check_global(&self, now_ms: i64) -> Decision {
        let limit = &self.config.global_limit;
        let Ok(mut map) = self.global.lock() else {
            warn!("global limiter state poisoned, admitting");
            return Decision::unlimited();
        };
        let state = map.entry(GLOBAL_KEY.to_string()).or_insert(WindowState {
            count: 0,
            window_start: now_ms,
        });
        fixed_window_admit(state, limit.max_requests, limit.window_ms, now_ms)
    }

    fn check_token_bucket(&self, tier_name: &str, ip: &str, tier: &Tier, now_ms: i64) -> Decision {
        let (Some(max), Some(refill)) = (tier.max_requests, tier.refill_rate) else {
            return Decision::unlimited();
        };
        if refill <= 0.0 {
            return Decision::unlimited();
        }
        let Ok(mut map) = self.buckets.lock() else {
            warn!("token bucket state poisoned, admitting");
            return Decision::unlimited();
        };
        let state = map
            .entry((tier_name.to_string(), ip.to_string()))
            .or_insert(BucketState {
                tokens: f64::from(max),
                last_refill: now_ms,
            });

        // Clamp so a clock discontinuity never drains the bucket.
        let elapsed_s = (now_ms - state.last_refill).max(0) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed_s * refill).min(f64::from(max));
        state.last_refill = now_ms;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            let reset_ms = if state.tokens <= 0.0 {
                (1000.0 / refill).ceil() as i64
            } else {
                0
            };
            Decision {
                allowed: true,
                remaining: state.tokens.floor() as i64,
                reset_ms,
                limit: i64::from(max),
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                reset_ms: (((1.0 - state.tokens) / refill) * 1000.0).ceil() as i64,
                limit: i64::from(max),
            }
        }
    }

    fn check_sliding_window(&self, tier_name: &str, ip: &str, tier: &Tier, now_ms: i64) -> Decision {
        let (Some(max), Some(window)) = (tier.max_requests, tier.window_ms) else {
            return Decision::unlimited();
        };
        let Ok(mut map) = self.sliding.lock() else {
            warn!("sliding window state poisoned, admitting");
            return Decision::unlimited();
        };
        let log = map
            .entry((tier_name.to_string(), ip.to_string()))
            .or_default();
        log.retain(|t| *t > now_ms - window);

        let reset_for = |log: &VecDeque<i64>| {
            log.front()
                .map_or(window, |oldest| window - (now_ms - oldest))
        };

        if (log.len() as u32) < max {
            log.push_back(now_ms);
            Decision {
                allowed: true,
                remaining: i64::from(max) - log.len() as i64,
                reset_ms: reset_for(log),
                limit: i64::from(max),
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                reset_ms: reset_for(log),
                limit: i64::from(max),
            }
        }
    }

    fn check_fixed_window(&self, tier_name: &str, ip: &str, tier: &Tier, now_ms: i64) -> Decision {
        let (Some(max), Some(window)) = (tier.max_requests, tier.window_ms) else {
            return Decision::unlimited();
        };
        let Ok(mut map) = self.fixed.lock() else {
            warn!("fixed window state poisoned, admitting");
            return Decision::unlimited();
        };
        let state = map
            .entry((tier_name.to_string(), ip.to_string()))
            .or_insert(WindowState {
                count: 0,
                window_start: now_ms,
            });
        fixed_window_admit(state, max, window, now_ms)
    }
}

/// Shared fixed-window admission over one counter. The up-to-2x burst across
/// a window edge is an accepted property of this algorithm.
fn fixed_window_admit(state: &mut WindowState, max: u32, window_ms: i64, now_ms: i64) -> Decision {
    if now_ms - state.window_start >= window_ms {
        state.count = 0;
        state.window_start = now_ms;
    }
    let reset_ms = window_ms - (now_ms - state.window_start);
    if state.count < max {
        state.count += 1;
        Decision {
            allowed: true,
            remaining: i64::from(max) - i64::from(state.count),
            reset_ms,
            limit: i64::from(max),
        }
    } else {
        Decision {
            allowed: false,
            remaining: 0,
            reset_ms,
            limit: i64::from(max),
        }
    }
}
