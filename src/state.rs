//! Shared application state and background maintenance tasks.
//!
//! All engines are behind `Arc` so the state clones cheaply into handlers.
//! Background tasks (debounced device persistence, hourly expiry sweep) are
//! tracked with `TaskTracker` and stopped through a `CancellationToken`;
//! `shutdown()` drains them and guarantees a final synchronous flush of the
//! device registry.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::analytics::Analytics;
use crate::config::{Config, SERVICE_NAME};
use crate::credentials::CredentialStore;
use crate::devices::{DeviceRegistry, PERSIST_DEBOUNCE_MS, SWEEP_INTERVAL_MS};
use crate::limiter::RateLimiter;
use crate::logging::FileLogger;
use crate::metrics;
use crate::middleware::IpRules;

/// Shared state for handlers and middleware. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub analytics: Arc<Analytics>,
    pub credentials: Arc<CredentialStore>,
    pub devices: Arc<DeviceRegistry>,
    pub ip_rules: Arc<IpRules>,
    pub file_logger: Option<Arc<FileLogger>>,
    pub config: Arc<Config>,
    started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Assemble the engines and spawn the maintenance tasks.
    pub async fn new(config: Config) -> Self {
        let rate_limit_hits = Arc::new(AtomicU64::new(0));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limits.clone(),
            rate_limit_hits.clone(),
        ));
        let analytics = Arc::new(Analytics::new(rate_limit_hits));
        let devices = Arc::new(DeviceRegistry::open(config.device_store_path.clone()).await);
        let file_logger = config.log_dir.as_ref().map(|dir| {
            Arc::new(FileLogger::new(
                SERVICE_NAME,
                dir.clone(),
                config.log_max_lines,
            ))
        });

        let state = Self {
            limiter,
            analytics,
            credentials: Arc::new(CredentialStore::new()),
            devices,
            ip_rules: Arc::new(config.ip_rules.clone()),
            file_logger,
            config: Arc::new(config),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        if let Some(dir) = &state.config.log_dir
            && let Err(e) = std::fs::create_dir_all(dir)
        {
            tracing::error!(dir = %dir.display(), error = %e, "failed to create log directory");
        }

        state.spawn_persistence_task();
        state.spawn_sweep_task();
        state
    }

    /// Debounced device persistence: every mutation raises the dirty flag,
    /// and the write happens once the flag has been quiet for the debounce
    /// window. Cancellation flushes before exiting.
    fn spawn_persistence_task(&self) {
        let devices = self.devices.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        devices.flush().await;
                        debug!("persistence task drained and flushed");
                        return;
                    }
                    _ = devices.dirty_notified() => {}
                }

                // Trailing edge: another mutation inside the window restarts
                // the timer.
                loop {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            devices.flush().await;
                            debug!("persistence task drained and flushed");
                            return;
                        }
                        _ = devices.dirty_notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(PERSIST_DEBOUNCE_MS)) => {
                            devices.flush().await;
                            debug!(path = %devices.store_path().display(), "device store persisted");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Hourly sweep of expired devices.
    fn spawn_sweep_task(&self) {
        let devices = self.devices.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(Duration::from_millis(SWEEP_INTERVAL_MS));
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        devices.sweep_expired().await;
                        metrics::set_active_devices(devices.live_count().await);
                    }
                }
            }
        });
    }

    /// Gracefully stop the maintenance tasks: signal cancellation, close the
    /// tracker, and wait for the final persistence flush.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");
        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        info!("All background tasks have completed");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn device_store_path(&self) -> &Path {
        self.devices.store_path()
    }
}
