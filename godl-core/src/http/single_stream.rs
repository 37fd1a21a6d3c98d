//! Phase §4.8 — HTTP single-stream fallback (non-ranged, or unknown-size,
//! or `concurrency == 1`).

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, RANGE};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Error;
use crate::progress::ProgressReporter;
use crate::rate_limiter::RateLimiter;
use crate::resume::SidecarProgress;
use crate::retry::{self, RetryPolicy};
use crate::sink::Sink;

/// Read buffer size for streamed bodies (spec §4.8 "fixed-size reads, default 64 KiB").
const READ_SLICE: usize = 64 * 1024;

/// Runs the single-stream transfer under the retry executor (spec §4.8: "On
/// disconnect, surface a retryable `NetworkError`... the retry executor
/// restarts with `Range: bytes=<new_existing>-`"). `offset` tracks how far
/// the transfer has progressed so each retry attempt resumes exactly where
/// the last one left off rather than from the original `existing` value.
/// Returns `(total_bytes_written, retries_used)`.
#[allow(clippy::too_many_arguments)]
pub async fn execute_with_retry(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    existing: u64,
    sink: &Sink,
    rate_limiter: &RateLimiter,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
    retry_policy: &RetryPolicy,
    sidecar: Option<&SidecarProgress>,
    total_size: i64,
) -> Result<(u64, u32), Error> {
    let offset = AtomicU64::new(existing);
    if let Some(sidecar) = sidecar {
        sidecar.save_now();
    }
    let (result, stats) = retry::execute_with_stats(
        || execute(client, url, headers, offset.load(Ordering::SeqCst), sink, rate_limiter, progress, cancel, &offset, sidecar, total_size),
        retry_policy,
        cancel,
    )
    .await;
    result.map(|()| (offset.load(Ordering::SeqCst), stats.attempts))
}

/// Streams `url`'s body sequentially into `sink`, starting at `existing`
/// bytes already present. `offset` is updated as bytes land so a caller
/// retrying after a disconnect can resume from the right place.
#[instrument(skip(client, headers, sink, rate_limiter, progress, cancel, offset, sidecar), fields(existing))]
#[allow(clippy::too_many_arguments)]
pub async fn execute(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    existing: u64,
    sink: &Sink,
    rate_limiter: &RateLimiter,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
    offset: &AtomicU64,
    sidecar: Option<&SidecarProgress>,
    total_size: i64,
) -> Result<(), Error> {
    let mut req_headers = headers.clone();
    if existing > 0 {
        let range_value = HeaderValue::from_str(&format!("bytes={existing}-")).map_err(|e| Error::config(e.to_string()))?;
        req_headers.insert(RANGE, range_value);
    }

    let response = client
        .get(url)
        .headers(req_headers)
        .send()
        .await
        .map_err(|e| Error::network(url.to_string(), e))?;

    let status = response.status();
    if status == StatusCode::RANGE_NOT_SATISFIABLE {
        debug!("416 on resume attempt, treating as already complete");
        return Ok(());
    }
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        let err = Error::http_status(url.to_string(), status.as_u16());
        let err = match response.headers().get(reqwest::header::RETRY_AFTER).and_then(|v| v.to_str().ok()).and_then(crate::retry::parse_retry_after) {
            Some(delay) => err.with_retry_after(delay),
            None => err,
        };
        return Err(err);
    }

    let mut stream = response.bytes_stream();

    while let Some(next) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let bytes = next.map_err(|e| {
            let at = offset.load(Ordering::SeqCst);
            Error::network(url.to_string(), e).with_details(format!("disconnected after {at} bytes"))
        })?;
        for slice in bytes.chunks(READ_SLICE) {
            rate_limiter
                .acquire_cancellable(slice.len() as u64, cancel)
                .await
                .map_err(|_| Error::cancelled())?;
            let at = offset.load(Ordering::SeqCst);
            sink.write_at(at, slice)?;
            let written = at + slice.len() as u64;
            offset.store(written, Ordering::SeqCst);
            progress.on_bytes(slice.len() as u64);
            if let Some(sidecar) = sidecar {
                sidecar.update(total_size, written);
            }
        }
    }

    Ok(())
}
