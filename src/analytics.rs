//! Analytics engine: bounded circular request log plus streaming statistics.
//!
//! The buffer holds the last 10,000 request records (~2 MB) and is the
//! authoritative source for the dashboard snapshot. Writers take the lock for
//! an O(1) append; readers copy the live entries under the lock and aggregate
//! on the copy, so a snapshot is always internally consistent and never
//! blocks the request path for the duration of the computation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;

/// Fixed buffer capacity. Oldest records are overwritten once reached.
pub const LOG_BUFFER_CAPACITY: usize = 10_000;

/// Window for the requests-per-minute figure.
const MINUTE_MS: i64 = 60_000;

/// Window for active-client and active-key aggregation.
const ACTIVE_WINDOW_MS: i64 = 300_000;

/// Endpoints reported in the snapshot leaderboard.
const TOP_ENDPOINTS: usize = 5;

/// One completed request, recorded when the response finalizes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    /// Wall-clock delta from request start to response finish, in ms.
    pub response_time: u64,
    pub client_id: String,
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub authenticated: bool,
}

/// Fixed-capacity ring. `head` is the insert index of the oldest entry once
/// full; `count` grows monotonically until it clamps at capacity.
struct CircularBuffer {
    entries: Vec<RequestLog>,
    head: usize,
    count: usize,
}

impl CircularBuffer {
    fn new() -> Self {
        Self {
            entries: Vec::with_capacity(LOG_BUFFER_CAPACITY),
            head: 0,
            count: 0,
        }
    }

    fn push(&mut self, log: RequestLog) {
        if self.count < LOG_BUFFER_CAPACITY {
            self.entries.push(log);
            self.count += 1;
        } else {
            self.entries[self.head] = log;
            self.head = (self.head + 1) % LOG_BUFFER_CAPACITY;
        }
    }

    /// Full chronological copy: `[head..] ++ [..head]` once the buffer wraps.
    fn chronological(&self) -> Vec<RequestLog> {
        let mut out = Vec::with_capacity(self.count);
        out.extend_from_slice(&self.entries[self.head..]);
        out.extend_from_slice(&self.entries[..self.head]);
        out
    }
}

/// Entry in the snapshot's endpoint leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointCount {
    pub path: String,
    pub count: u64,
}

/// Derived statistics view served to the dashboard.
///
/// `error_rate` and `avg_response_time` aggregate the entire buffer
/// (historical), not the last minute; dashboard consumers rely on that.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub total_requests: usize,
    pub requests_per_minute: usize,
    pub top_endpoints: Vec<EndpointCount>,
    pub error_rate: f64,
    pub avg_response_time: f64,
    pub active_clients: usize,
    pub active_key_uses: usize,
    pub rate_limit_hits: u64,
}

/// Engine owning the buffer and the shared rate-limit hit counter.
pub struct Analytics {
    buffer: Mutex<CircularBuffer>,
    hits: Arc<AtomicU64>,
}

impl Analytics {
    pub fn new(hits: Arc<AtomicU64>) -> Self {
        Self {
            buffer: Mutex::new(CircularBuffer::new()),
            hits,
        }
    }

    /// Append one record; amortized O(1).
    pub fn record(&self, log: RequestLog) {
        self.lock().push(log);
    }

    /// Newest-first page over the ordered view, for the paginated log read.
    pub fn recent(&self, limit: usize, offset: usize) -> Vec<RequestLog> {
        let mut logs = self.lock().chronological();
        logs.reverse();
        logs.into_iter().skip(offset).take(limit).collect()
    }

    /// Compute the snapshot against the current wall clock.
    pub fn snapshot(&self) -> AnalyticsSnapshot {
        self.snapshot_at(Utc::now().timestamp_millis())
    }

    /// Deterministic snapshot against an explicit clock reading.
    pub fn snapshot_at(&self, now_ms: i64) -> AnalyticsSnapshot {
        // Copy under the lock, aggregate on the copy.
        let logs = self.lock().chronological();
        let total = logs.len();

        let requests_per_minute = logs
            .iter()
            .filter(|l| l.timestamp > now_ms - MINUTE_MS)
            .count();

        let mut by_path: HashMap<&str, u64> = HashMap::new();
        for log in &logs {
            *by_path.entry(log.path.as_str()).or_default() += 1;
        }
        let mut top: Vec<EndpointCount> = by_path
            .into_iter()
            .map(|(path, count)| EndpointCount {
                path: path.to_string(),
                count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        top.truncate(TOP_ENDPOINTS);

        let (error_rate, avg_response_time) = if total == 0 {
            (0.0, 0.0)
        } else {
            let errors = logs.iter().filter(|l| l.status_code >= 400).count();
            let total_time: u64 = logs.iter().map(|l| l.response_time).sum();
            (
                round2(100.0 * errors as f64 / total as f64),
                round2(total_time as f64 / total as f64),
            )
        };

        let mut active_ips: HashSet<&str> = HashSet::new();
        let mut active_key_pairs: HashSet<(&str, &str)> = HashSet::new();
        for log in &logs {
            if log.timestamp <= now_ms - ACTIVE_WINDOW_MS {
                continue;
            }
            active_ips.insert(log.ip.as_str());
            if let Some(key) = &log.api_key {
                active_key_pairs.insert((log.ip.as_str(), key.as_str()));
            }
        }

        AnalyticsSnapshot {
            total_requests: total,
            requests_per_minute,
            top_endpoints: top,
            error_rate,
            avg_response_time,
            active_clients: active_ips.len(),
            active_key_uses: active_key_pairs.len(),
            rate_limit_hits: self.hits.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircularBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
