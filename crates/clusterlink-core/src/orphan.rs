//! Sampling of responses that arrive after their operation was abandoned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Orphaned response logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanLogConfig {
    /// Whether orphans are recorded at all.
    pub enabled: bool,
    /// Reporting period (default: 10s).
    pub interval_ms: u64,
    /// Records kept per period (default: 10).
    pub sample_size: usize,
}

impl Default for OrphanLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            sample_size: 10,
        }
    }
}

impl OrphanLogConfig {
    /// Reporting period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// One orphaned response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanRecord {
    /// Operation the response belonged to.
    pub operation: String,
    /// Opaque of the abandoned request.
    pub opaque: u32,
    /// Address of the node that answered.
    pub remote: String,
    /// Response body size.
    pub payload_size: usize,
    /// Time between sending the request and receiving the response.
    pub elapsed_us: u64,
}

/// Collects a bounded sample of the slowest orphans and logs it
/// periodically.
#[derive(Debug)]
pub struct OrphanReporter {
    config: OrphanLogConfig,
    sample: Mutex<Vec<OrphanRecord>>,
    total: AtomicU64,
}

impl OrphanReporter {
    /// Creates a reporter.
    pub fn new(config: OrphanLogConfig) -> Self {
        Self {
            config,
            sample: Mutex::new(Vec::new()),
            total: AtomicU64::new(0),
        }
    }

    /// Records an orphan.
    pub fn record(&self, record: OrphanRecord) {
        if !self.config.enabled {
            return;
        }
        debug!(
            operation = %record.operation,
            opaque = record.opaque,
            remote = %record.remote,
            "orphaned response"
        );
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut sample = self.sample.lock().unwrap_or_else(|e| e.into_inner());
        sample.push(record);
        sample.sort_by(|a, b| b.elapsed_us.cmp(&a.elapsed_us));
        sample.truncate(self.config.sample_size);
    }

    /// Number of orphans recorded since the last report.
    pub fn pending(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Takes the current sample as a JSON report, if anything was recorded.
    pub fn take_report(&self) -> Option<serde_json::Value> {
        let total = self.total.swap(0, Ordering::Relaxed);
        let sample = std::mem::take(&mut *self.sample.lock().unwrap_or_else(|e| e.into_inner()));
        if total == 0 {
            return None;
        }
        Some(json!({
            "kv": {
                "total_count": total,
                "top_requests": sample,
            }
        }))
    }

    /// Logs a report every interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            return;
        }
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(report) = self.take_report() {
                        warn!(report = %report, "orphaned responses observed");
                    }
                }
            }
        }
    }
}
