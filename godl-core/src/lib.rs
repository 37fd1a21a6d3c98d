//! `godl_core` — the download engine: protocol dispatch, chunked/resumable
//! HTTP transfer, retry, rate limiting, progress and metrics.
//!
//! # Architecture
//!
//! - [`downloader`] — the [`Downloader`] facade: normalizes options, talks to
//!   the registry, assembles [`DownloadStats`].
//! - [`registry`] — scheme → handler dispatch.
//! - [`http`] — the `http`/`https` handler: probe, chunk planning, the
//!   chunked and single-stream transfer strategies.
//! - [`retry`] — backoff-driven retry executor shared by both transfer paths.
//! - [`rate_limiter`] — token-bucket throughput limiting.
//! - [`progress`] — fan-in progress reporting with EMA speed smoothing.
//! - [`metrics`] — per-download records and aggregated counters.
//! - [`sink`] — positional file writes and atomic finalize.
//! - [`resume`] — partial-file inspection and the `.godlpart` sidecar.
//! - [`error`] — the closed error-kind taxonomy.
//!
//! ```no_run
//! use godl_core::{DownloadRequest, Downloader};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), godl_core::Error> {
//! let downloader = Downloader::new();
//! let request = DownloadRequest::new("https://example.com/file.bin");
//! let stats = downloader.download(request, CancellationToken::new()).await?;
//! println!("wrote {} bytes", stats.bytes_downloaded);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod downloader;
pub mod error;
pub mod http;
pub mod metrics;
pub mod progress;
pub mod rate_limiter;
pub mod registry;
pub mod request;
pub mod resume;
pub mod retry;
pub mod sink;
pub mod stats;

pub use downloader::Downloader;
pub use error::{Error, ErrorKind};
pub use metrics::{AggregatedMetrics, DownloadMetrics, MetricsCollector};
pub use progress::{ProgressReporter, ProgressUpdate};
pub use rate_limiter::RateLimiter;
pub use registry::{ProtocolHandler, ProtocolRegistry};
pub use request::{ChunkSizePolicy, DownloadRequest, FileInfo, ProgressCallback};
pub use retry::RetryPolicy;
pub use stats::DownloadStats;
