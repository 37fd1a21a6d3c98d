//! Facade (spec §4.10) — normalizes options, generates a `download_id`,
//! records metrics, delegates to the registry, and assembles [`DownloadStats`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;
use crate::http::HttpHandler;
use crate::metrics::MetricsCollector;
use crate::registry::ProtocolRegistry;
use crate::request::DownloadRequest;
use crate::stats::DownloadStats;

/// Embeddable entry point: `facade → registry → handler` (spec §2 "Flow").
pub struct Downloader {
    registry: Arc<ProtocolRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    /// Builds a downloader with the built-in `http`/`https` handlers
    /// registered. FTP/S3 are out of scope but can be added via
    /// [`Downloader::registry`] (spec §1, §9 "Duplicated FTP/S3 code").
    #[must_use]
    pub fn new() -> Self {
        let registry = Arc::new(ProtocolRegistry::new());
        registry.register(Arc::new(HttpHandler::http())).expect("http handler registers once");
        registry.register(Arc::new(HttpHandler::https())).expect("https handler registers once");
        Self { registry, metrics: Arc::new(MetricsCollector::new()) }
    }

    /// Exposes the protocol registry so callers can register additional
    /// handlers before issuing downloads.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    /// Exposes the metrics collector for dashboards/export.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Normalizes `request`, dispatches it, and records metrics at each
    /// lifecycle stage.
    #[instrument(skip(self, request, cancel), fields(url))]
    pub async fn download(&self, request: DownloadRequest, cancel: CancellationToken) -> Result<DownloadStats, Error> {
        let request = request.normalize()?;
        let download_id = self.metrics.next_download_id();
        self.metrics.record_start(&download_id, &request.url);

        let metrics = self.metrics.clone();
        let recorded_id = download_id.clone();
        let user_callback = request.progress_callback.clone();
        let request = request.with_progress_callback(move |update| {
            metrics.record_progress(&recorded_id, update.bytes_downloaded, update.total_size, update.speed_bps);
            if let Some(callback) = &user_callback {
                (callback.0)(update);
            }
        });

        let stats = self.registry.download(&request, cancel).await?;

        self.metrics.record_complete(&download_id, &stats);
        Ok(stats)
    }
}
