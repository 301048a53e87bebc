//! TOTP device registry with debounced JSON persistence.
//!
//! The in-memory map is authoritative; the JSON document on disk is a
//! best-effort mirror rebuilt on every flush. Persistence failures are logged
//! and swallowed, never failing a user request, and the next mutation retries
//! the write. Expired entries are removed eagerly on lookup and in an hourly
//! sweep; revoked entries are tombstoned until the sweep collects them once
//! their lifetime lapses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::totp;

/// Device lifetime from (re-)registration.
pub const DEVICE_TTL_MS: i64 = 7 * 24 * 3_600_000;

/// Registration velocity: attempts per IP tolerated inside the window.
const MAX_ATTEMPTS_PER_WINDOW: usize = 10;
const ATTEMPT_WINDOW_MS: i64 = 60_000;

/// Hard cap on concurrently active devices per IP.
const MAX_ACTIVE_DEVICES_PER_IP: usize = 30;

/// Trailing-edge debounce for persistence writes.
pub const PERSIST_DEBOUNCE_MS: u64 = 2_000;

/// Cadence of the expiry sweep.
pub const SWEEP_INTERVAL_MS: u64 = 3_600_000;

/// A registered browser instance paired with its shared TOTP secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntry {
    pub browser_id: String,
    pub shared_secret: String,
    pub ip: String,
    pub user_agent: String,
    pub registered_at: i64,
    pub expires_at: i64,
    pub last_seen: i64,
    pub last_ip: String,
    pub active: bool,
}

impl DeviceEntry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.active && self.expires_at > now_ms
    }
}

/// On-disk document shape: `{"devices":[...]}`.
#[derive(Serialize, Deserialize, Default)]
struct DeviceFile {
    devices: Vec<DeviceEntry>,
}

/// Registry over the device map, the registration-attempt ledger, and the
/// dirty-flag used by the debounced persistence task.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
    attempts: Mutex<HashMap<String, Vec<i64>>>,
    path: PathBuf,
    dirty: Notify,
}

impl DeviceRegistry {
    /// Open the registry at `path`, creating the parent directory and loading
    /// any existing document. Unreadable or malformed files start the
    /// registry empty rather than failing startup.
    pub async fn open(path: PathBuf) -> Self {
        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            error!(path = %parent.display(), error = %e, "failed to create device store directory");
        }

        let devices = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<DeviceFile>(&raw) {
                Ok(file) => {
                    info!(count = file.devices.len(), path = %path.display(), "loaded device registry");
                    file.devices
                        .into_iter()
                        .map(|d| (d.browser_id.clone(), d))
                        .collect()
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "device store is malformed, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no device store yet, starting empty");
                HashMap::new()
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read device store, starting empty");
                HashMap::new()
            }
        };

        Self {
            devices: RwLock::new(devices),
            attempts: Mutex::new(HashMap::new()),
            path,
            dirty: Notify::new(),
        }
    }

    /// Register (or refresh) a device for `browser_id`.
    pub async fn register(
        &self,
        browser_id: &str,
        ip: &str,
        user_agent: &str,
    ) -> GatewayResult<DeviceEntry> {
        self.register_at(browser_id, ip, user_agent, Utc::now().timestamp_millis())
            .await
    }

    pub(crate) async fn register_at(
        &self,
        browser_id: &str,
        ip: &str,
        user_agent: &str,
        now_ms: i64,
    ) -> GatewayResult<DeviceEntry> {
        // The attempt is recorded before the cap check, so a rejected caller
        // still counts against the next one.
        if !self.record_attempt(ip, now_ms) {
            warn!(ip, "registration velocity cap hit");
            return Err(GatewayError::RegistrationThrottled);
        }

        let mut devices = self.devices.write().await;

        let live_for_ip = devices
            .values()
            .filter(|d| d.ip == ip && d.is_live(now_ms))
            .count();
        if live_for_ip >= MAX_ACTIVE_DEVICES_PER_IP {
            warn!(ip, count = live_for_ip, "device cap reached for IP");
            return Err(GatewayError::Forbidden(
                "Device limit reached for this IP".to_string(),
            ));
        }

        if let Some(entry) = devices.get_mut(browser_id)
            && entry.is_live(now_ms)
        {
            // Idempotent re-registration: same secret, extended lifetime.
            entry.expires_at = now_ms + DEVICE_TTL_MS;
            entry.last_seen = now_ms;
            entry.last_ip = ip.to_string();
            let refreshed = entry.clone();
            drop(devices);
            self.mark_dirty();
            return Ok(refreshed);
        }

        let entry = DeviceEntry {
            browser_id: browser_id.to_string(),
            shared_secret: totp::generate_secret(),
            ip: ip.to_string(),
            user_agent: user_agent.to_string(),
            registered_at: now_ms,
            expires_at: now_ms + DEVICE_TTL_MS,
            last_seen: now_ms,
            last_ip: ip.to_string(),
            active: true,
        };
        devices.insert(browser_id.to_string(), entry.clone());
        drop(devices);
        self.mark_dirty();
        Ok(entry)
    }

    /// Resolve a device for authentication. Expired and inactive devices are
    /// indistinguishable from absent; expired entries are removed eagerly.
    pub async fn get(&self, browser_id: &str) -> Option<DeviceEntry> {
        self.get_at(browser_id, Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn get_at(&self, browser_id: &str, now_ms: i64) -> Option<DeviceEntry> {
        let mut devices = self.devices.write().await;
        let entry = devices.get(browser_id)?;
        if entry.expires_at <= now_ms {
            devices.remove(browser_id);
            drop(devices);
            self.mark_dirty();
            return None;
        }
        if !entry.active {
            return None;
        }
        Some(entry.clone())
    }

    /// Record a successful TOTP authentication.
    pub async fn touch(&self, browser_id: &str, ip: &str) {
        let now_ms = Utc::now().timestamp_millis();
        let mut devices = self.devices.write().await;
        if let Some(entry) = devices.get_mut(browser_id) {
            entry.last_seen = now_ms;
            entry.last_ip = ip.to_string();
            drop(devices);
            self.mark_dirty();
        }
    }

    /// Tombstone a device. Returns false when the id is unknown.
    pub async fn revoke(&self, browser_id: &str) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(browser_id) {
            Some(entry) => {
                entry.active = false;
                drop(devices);
                self.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Remove entries past their expiry; returns how many were swept.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn sweep_expired_at(&self, now_ms: i64) -> usize {
        let mut devices = self.devices.write().await;
        let before = devices.len();
        devices.retain(|_, d| d.expires_at > now_ms);
        let removed = before - devices.len();
        drop(devices);
        if removed > 0 {
            info!(removed, "swept expired devices");
            self.mark_dirty();
        }
        removed
    }

    /// Active, unexpired device count (metrics gauge).
    pub async fn live_count(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        self.devices
            .read()
            .await
            .values()
            .filter(|d| d.is_live(now_ms))
            .count()
    }

    /// Serialize the current map to disk. The write goes to a temp file that
    /// is renamed over the target, and no lock is held for the I/O.
    pub async fn flush(&self) {
        let mut snapshot: Vec<DeviceEntry> = {
            let devices = self.devices.read().await;
            devices.values().cloned().collect()
        };
        snapshot.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));

        let document = DeviceFile { devices: snapshot };
        let json = match serde_json::to_string_pretty(&document) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize device store");
                return;
            }
        };

        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            error!(path = %tmp.display(), error = %e, "failed to write device store");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            error!(path = %self.path.display(), error = %e, "failed to replace device store");
        }
    }

    /// Completes once a mutation has marked the registry dirty.
    pub async fn dirty_notified(&self) {
        self.dirty.notified().await;
    }

    pub fn store_path(&self) -> &Path {
        &self.path
    }

    fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    /// Prune the attempt ledger to the window and record this attempt.
    /// Returns false when the velocity cap is exceeded.
    fn record_attempt(&self, ip: &str, now_ms: i64) -> bool {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let ledger = attempts.entry(ip.to_string()).or_default();
        ledger.retain(|t| *t > now_ms - ATTEMPT_WINDOW_MS);
        ledger.push(now_ms);
        ledger.len() <= MAX_ATTEMPTS_PER_WINDOW
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const BROWSER_ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    async fn registry() -> (tempfile::TempDir, DeviceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::open(dir.path().join("devices.json")).await;
        (dir, registry)
    }

    #[tokio::test]
    async fn registration_issues_secret_and_expiry() {
        let (_dir, registry) = registry().await;
        let entry = registry
            .register_at(BROWSER_ID, "10.0.0.1", "test-agent", 1_000)
            .await
            .unwrap();
        assert_eq!(entry.browser_id, BROWSER_ID);
        assert_eq!(entry.shared_secret.len(), 64);
        assert_eq!(entry.expires_at, 1_000 + DEVICE_TTL_MS);
        assert!(entry.active);
    }

    #[tokio::test]
    async fn re_registration_is_idempotent_and_extends_expiry() {
        let (_dir, registry) = registry().await;
        let first = registry
            .register_at(BROWSER_ID, "10.0.0.1", "agent", 0)
            .await
            .unwrap();
        let second = registry
            .register_at(BROWSER_ID, "10.0.0.2", "agent", 5_000)
            .await
            .unwrap();

        assert_eq!(first.shared_secret, second.shared_secret);
        assert_eq!(second.expires_at, 5_000 + DEVICE_TTL_MS);
        assert_eq!(second.last_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn velocity_cap_allows_ten_then_rejects() {
        let (_dir, registry) = registry().await;
        for i in 0..10 {
            registry
                .register_at(&format!("id-{i}"), "9.9.9.9", "agent", 0)
                .await
                .unwrap();
        }
        let err = registry
            .register_at("id-10", "9.9.9.9", "agent", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RegistrationThrottled));

        // A different IP is unaffected.
        assert!(
            registry
                .register_at("other", "8.8.8.8", "agent", 1)
                .await
                .is_ok()
        );

        // Once the window rolls past, the same IP may try again.
        assert!(
            registry
                .register_at("id-10", "9.9.9.9", "agent", 70_000)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn device_cap_per_ip() {
        let (_dir, registry) = registry().await;
        // Space attempts out so the velocity cap never trips.
        for i in 0..30 {
            registry
                .register_at(&format!("dev-{i}"), "7.7.7.7", "agent", i * 120_000)
                .await
                .unwrap();
        }
        let err = registry
            .register_at("dev-30", "7.7.7.7", "agent", 31 * 120_000)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn expired_devices_vanish_on_lookup() {
        let (_dir, registry) = registry().await;
        registry
            .register_at(BROWSER_ID, "10.0.0.1", "agent", 0)
            .await
            .unwrap();

        assert!(registry.get_at(BROWSER_ID, DEVICE_TTL_MS - 1).await.is_some());
        assert!(registry.get_at(BROWSER_ID, DEVICE_TTL_MS).await.is_none());
        // Eagerly removed, so even an earlier clock no longer sees it.
        assert!(registry.get_at(BROWSER_ID, 0).await.is_none());
    }

    #[tokio::test]
    async fn revoked_devices_do_not_authenticate() {
        let (_dir, registry) = registry().await;
        registry
            .register_at(BROWSER_ID, "10.0.0.1", "agent", 0)
            .await
            .unwrap();
        assert!(registry.revoke(BROWSER_ID).await);
        assert!(registry.get_at(BROWSER_ID, 1).await.is_none());
        assert!(!registry.revoke("unknown-id").await);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let (_dir, registry) = registry().await;
        registry
            .register_at("old", "10.0.0.1", "agent", 0)
            .await
            .unwrap();
        registry
            .register_at("new", "10.0.0.2", "agent", 10_000)
            .await
            .unwrap();

        let removed = registry.sweep_expired_at(DEVICE_TTL_MS + 5_000).await;
        assert_eq!(removed, 1);
        assert!(registry.get_at("new", DEVICE_TTL_MS + 5_000).await.is_some());
    }

    #[tokio::test]
    async fn flush_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.json");

        let registry = DeviceRegistry::open(path.clone()).await;
        let entry = registry
            .register_at(BROWSER_ID, "10.0.0.1", "agent", 1_000)
            .await
            .unwrap();
        registry.flush().await;

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(raw.contains("\"devices\""));
        assert!(raw.contains(BROWSER_ID));

        let reloaded = DeviceRegistry::open(path).await;
        let loaded = reloaded.get_at(BROWSER_ID, 2_000).await.unwrap();
        assert_eq!(loaded.shared_secret, entry.shared_secret);
    }

    #[tokio::test]
    async fn mutations_signal_the_dirty_flag() {
        let (_dir, registry) = registry().await;
        registry
            .register_at(BROWSER_ID, "10.0.0.1", "agent", 0)
            .await
            .unwrap();
        // The stored permit from the mutation completes immediately.
        tokio::time::timeout(std::time::Duration::from_millis(50), registry.dirty_notified())
            .await
            .expect("dirty flag was not raised");
    }
}
