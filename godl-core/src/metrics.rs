//! Metrics collector — per-download records plus aggregated counters (spec §4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::ErrorKind;
use crate::stats::DownloadStats;

/// Default retention window for completed records (24 hours).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between periodic cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Per-download lifecycle record.
#[derive(Debug, Clone)]
pub struct DownloadMetrics {
    pub download_id: String,
    pub url: String,
    pub protocol: String,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub bytes_downloaded: u64,
    pub total_size: i64,
    pub speed_bps: f64,
    pub success: Option<bool>,
    pub error_kind: Option<ErrorKind>,
}

impl DownloadMetrics {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Snapshot of aggregate counters, recomputed on each completion and cleanup
/// (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct AggregatedMetrics {
    pub total_downloads: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub total_bytes: u64,
    pub average_speed_bps: f64,
    pub throughput_mbps: f64,
    pub by_protocol: std::collections::HashMap<String, u64>,
    pub by_error_kind: std::collections::HashMap<&'static str, u64>,
}

/// Extracts the protocol bucket from a URL scheme (spec §4.4).
#[must_use]
pub fn protocol_from_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => match u.scheme() {
            s @ ("http" | "https" | "ftp" | "s3") => s.to_string(),
            _ => "unknown".to_string(),
        },
        Err(_) => "unknown".to_string(),
    }
}

/// Concurrent map from `download_id` to [`DownloadMetrics`], with a cached
/// [`AggregatedMetrics`] snapshot recomputed on completion/cleanup.
pub struct MetricsCollector {
    records: DashMap<String, DownloadMetrics>,
    aggregated: std::sync::RwLock<AggregatedMetrics>,
    next_id: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            aggregated: std::sync::RwLock::new(AggregatedMetrics::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Generates a monotonically increasing `download_id` string.
    #[must_use]
    pub fn next_download_id(&self) -> String {
        format!("dl-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    #[instrument(skip(self))]
    pub fn record_start(&self, id: &str, url: &str) {
        self.records.insert(
            id.to_string(),
            DownloadMetrics {
                download_id: id.to_string(),
                url: url.to_string(),
                protocol: protocol_from_url(url),
                start_time: SystemTime::now(),
                end_time: None,
                bytes_downloaded: 0,
                total_size: -1,
                speed_bps: 0.0,
                success: None,
                error_kind: None,
            },
        );
    }

    pub fn record_progress(&self, id: &str, bytes: u64, total: i64, speed: f64) {
        if let Some(mut rec) = self.records.get_mut(id) {
            rec.bytes_downloaded = bytes;
            rec.total_size = total;
            rec.speed_bps = speed;
        }
    }

    #[instrument(skip(self, stats))]
    pub fn record_complete(&self, id: &str, stats: &DownloadStats) {
        if let Some(mut rec) = self.records.get_mut(id) {
            rec.end_time = Some(stats.end_time);
            rec.bytes_downloaded = stats.bytes_downloaded;
            rec.total_size = stats.total_size;
            rec.speed_bps = stats.average_speed_bps;
            rec.success = Some(stats.success);
            rec.error_kind = stats.error.as_ref().map(|e| e.kind());
        }
        self.recompute_aggregated();
    }

    #[must_use]
    pub fn get_download(&self, id: &str) -> Option<DownloadMetrics> {
        self.records.get(id).map(|r| r.clone())
    }

    #[must_use]
    pub fn get_aggregated(&self) -> AggregatedMetrics {
        self.aggregated.read().expect("metrics lock poisoned").clone()
    }

    /// Removes completed records whose `end_time` is older than `retention`.
    /// Incomplete records are never evicted (spec §4.4).
    pub fn cleanup_older_than(&self, retention: Duration) {
        let cutoff = SystemTime::now() - retention;
        self.records.retain(|_, rec| match rec.end_time {
            Some(end) => end >= cutoff,
            None => true,
        });
        self.recompute_aggregated();
    }

    /// Spawns a background task that calls [`Self::cleanup_older_than`] every
    /// `interval` (spec §4.4 "a periodic cleanup task"). A one-shot CLI
    /// invocation has no need for this — it exists for a long-lived
    /// embedder (a service wrapping the library across many downloads)
    /// that wants bounded memory use without polling `cleanup_older_than`
    /// itself. Dropping the returned handle does not stop the task; abort
    /// it explicitly when the embedder shuts down.
    pub fn spawn_periodic_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(?retention, "running periodic metrics cleanup");
                collector.cleanup_older_than(retention);
            }
        })
    }

    fn recompute_aggregated(&self) {
        let mut total_downloads = 0u64;
        let mut successful = 0u64;
        let mut failed = 0u64;
        let mut total_bytes = 0u64;
        let mut speed_sum = 0.0;
        let mut speed_count = 0u64;
        let mut by_protocol = std::collections::HashMap::new();
        let mut by_error_kind: std::collections::HashMap<&'static str, u64> = std::collections::HashMap::new();

        for rec in self.records.iter() {
            if !rec.is_complete() {
                continue;
            }
            total_downloads += 1;
            total_bytes += rec.bytes_downloaded;
            *by_protocol.entry(rec.protocol.clone()).or_insert(0) += 1;

            match rec.success {
                Some(true) => {
                    successful += 1;
                    speed_sum += rec.speed_bps;
                    speed_count += 1;
                }
                Some(false) => {
                    failed += 1;
                    let label = rec.error_kind.map(ErrorKind::label).unwrap_or("unknown");
                    *by_error_kind.entry(label).or_insert(0) += 1;
                }
                None => {}
            }
        }

        let success_rate = if total_downloads > 0 {
            successful as f64 / total_downloads as f64
        } else {
            0.0
        };
        let average_speed_bps = if speed_count > 0 { speed_sum / speed_count as f64 } else { 0.0 };

        *self.aggregated.write().expect("metrics lock poisoned") = AggregatedMetrics {
            total_downloads,
            successful,
            failed,
            success_rate,
            total_bytes,
            average_speed_bps,
            throughput_mbps: average_speed_bps / 1_048_576.0,
            by_protocol,
            by_error_kind,
        };
    }

    /// Exports a JSON snapshot of the aggregated metrics.
    #[must_use]
    pub fn export(&self) -> Value {
        let agg = self.get_aggregated();
        json!({
            "total_downloads": agg.total_downloads,
            "successful": agg.successful,
            "failed": agg.failed,
            "success_rate": agg.success_rate,
            "total_bytes": agg.total_bytes,
            "average_speed_bps": agg.average_speed_bps,
            "throughput_mbps": agg.throughput_mbps,
            "by_protocol": agg.by_protocol,
            "by_error_kind": agg.by_error_kind.iter().map(|(k, v)| (k.to_string(), *v)).collect::<std::collections::HashMap<_, _>>(),
        })
    }
}
