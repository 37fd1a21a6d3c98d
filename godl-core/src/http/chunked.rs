//! Phase 3 & 4 — Execute and Finalize, the chunked/parallel transfer path
//! (spec §4.7). A bounded pool of workers pulls chunks from a shared queue;
//! each chunk fetch is wrapped in the retry executor and streams into the
//! sink at its own offset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::Error;
use crate::http::planner::{ChunkPlan, ChunkSpec};
use crate::progress::ProgressReporter;
use crate::rate_limiter::RateLimiter;
use crate::resume::{ChunkRecord, Sidecar};
use crate::retry::{self, RetryPolicy};
use crate::sink::Sink;

/// Read buffer size for streamed response bodies (spec §5 "fixed at 64 KiB").
const READ_SLICE: usize = 64 * 1024;

/// Shared, read-only context every worker needs; cheap to clone (all `Arc`).
#[derive(Clone)]
pub struct ChunkedContext {
    pub client: Client,
    pub url: String,
    pub headers: HeaderMap,
    pub sink: Arc<Sink>,
    pub rate_limiter: Arc<RateLimiter>,
    pub progress: Arc<ProgressReporter>,
    pub retry_policy: RetryPolicy,
    pub cancel: CancellationToken,
    pub sidecar_path: std::path::PathBuf,
    pub sidecar: Arc<tokio::sync::Mutex<Sidecar>>,
    /// Total retries spent across all chunks, for [`crate::stats::DownloadStats::retries`].
    pub retries: Arc<AtomicU64>,
    /// Worker pool cap (spec §5 "at most `concurrency` workers (1..32)").
    pub concurrency: usize,
}

/// Runs the chunked transfer for `plan`, returning the number of chunks
/// actually used and the total retries spent across all chunks. On any
/// chunk's terminal failure, remaining chunks are cancelled (spec §4.7
/// Phase 3 step 3). The worker pool never exceeds `ctx.concurrency`, even
/// when the plan has many more chunks than that — workers drain the shared
/// queue until it's empty rather than one task per chunk.
#[instrument(skip(ctx, plan), fields(chunks = plan.chunks.len()))]
pub async fn execute(ctx: ChunkedContext, plan: ChunkPlan) -> Result<(usize, u32), Error> {
    let worker_count = worker_count_for(plan.chunks.len(), ctx.concurrency);
    let (tx, rx) = mpsc::unbounded_channel::<ChunkSpec>();
    for chunk in &plan.chunks {
        tx.send(*chunk).expect("receiver outlives all sends");
    }
    drop(tx);

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let fatal = Arc::new(tokio::sync::Mutex::new(None::<Error>));
    let mut handles = Vec::with_capacity(worker_count);

    for _ in 0..worker_count {
        let ctx = ctx.clone();
        let rx = rx.clone();
        let fatal = fatal.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let next = { rx.lock().await.recv().await };
                let Some(chunk) = next else { break };
                if ctx.cancel.is_cancelled() {
                    break;
                }
                match download_chunk(&ctx, chunk).await {
                    Ok(()) => {
                        record_chunk_progress(&ctx, chunk).await;
                    }
                    Err(e) => {
                        warn!(chunk = chunk.index, error = %e, "chunk failed, cancelling siblings");
                        *fatal.lock().await = Some(e);
                        ctx.cancel.cancel();
                        break;
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    if let Some(err) = fatal.lock().await.take() {
        return Err(err);
    }
    if ctx.cancel.is_cancelled() {
        return Err(Error::cancelled());
    }
    #[allow(clippy::cast_possible_truncation)]
    let retries = ctx.retries.load(Ordering::Relaxed) as u32;
    Ok((plan.chunks.len(), retries))
}

/// Never more workers than chunks (nothing to do with the spares), and never
/// more than `concurrency` (spec §5 "at most `concurrency` workers (1..32)")
/// regardless of how many chunks the plan has.
fn worker_count_for(chunk_count: usize, concurrency: usize) -> usize {
    chunk_count.max(1).min(concurrency.max(1))
}

async fn record_chunk_progress(ctx: &ChunkedContext, chunk: ChunkSpec) {
    let mut sidecar = ctx.sidecar.lock().await;
    sidecar.upsert_chunk(ChunkRecord {
        index: chunk.index,
        start: chunk.start,
        end: chunk.end_inclusive,
        bytes_written: chunk.len(),
    });
    if let Err(e) = sidecar.save(&ctx.sidecar_path) {
        debug!(error = %e, "failed to persist sidecar after chunk completion");
    }
}

/// Downloads one chunk under the retry executor. Retries resume the
/// *remaining* sub-range from wherever the previous attempt left off
/// (spec §4.7 Phase 3 step 2e), tracked via a shared offset counter.
async fn download_chunk(ctx: &ChunkedContext, chunk: ChunkSpec) -> Result<(), Error> {
    let offset = Arc::new(AtomicU64::new(chunk.start));
    let retries_counter = ctx.retries.clone();
    let policy = ctx.retry_policy;
    let cancel = ctx.cancel.clone();
    let ctx = ctx.clone();
    let offset_for_op = offset.clone();

    let (result, stats) = retry::execute_with_stats(
        move || {
            let ctx = ctx.clone();
            let offset = offset_for_op.clone();
            async move { fetch_and_write(&ctx, chunk, &offset).await }
        },
        &policy,
        &cancel,
    )
    .await;
    retries_counter.fetch_add(u64::from(stats.attempts), Ordering::Relaxed);
    result
}

async fn fetch_and_write(ctx: &ChunkedContext, chunk: ChunkSpec, offset: &Arc<AtomicU64>) -> Result<(), Error> {
    let current = offset.load(Ordering::SeqCst);
    if current > chunk.end_inclusive {
        return Ok(());
    }

    let mut headers = ctx.headers.clone();
    let range_value = format!("bytes={current}-{}", chunk.end_inclusive);
    let range_header = reqwest::header::HeaderValue::from_str(&range_value).map_err(|e| Error::config(e.to_string()))?;
    headers.insert(RANGE, range_header);

    let response = ctx
        .client
        .get(&ctx.url)
        .headers(headers)
        .send()
        .await
        .map_err(|e| Error::network(ctx.url.clone(), e))?;

    if response.status() != StatusCode::PARTIAL_CONTENT {
        // Mid-flight downgrade to 200 on a chunk request is out of spec
        // (probe-time downgrade is handled before chunking starts); treat
        // as a non-retryable server inconsistency for this attempt.
        return Err(with_retry_after(
            Error::http_status(ctx.url.clone(), response.status().as_u16())
                .with_details("expected 206 Partial Content for ranged chunk request"),
            response.headers(),
        ));
    }
    if !content_range_aligns(response.headers(), current, chunk.end_inclusive) {
        return Err(Error::http_status(ctx.url.clone(), response.status().as_u16())
            .with_details("Content-Range did not match requested range"));
    }

    let mut stream = response.bytes_stream();
    let mut write_offset = current;
    let expected_end = chunk.end_inclusive;

    while let Some(next) = stream.next().await {
        if ctx.cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let bytes = next.map_err(|e| Error::network(ctx.url.clone(), e))?;
        for slice in bytes.chunks(READ_SLICE) {
            ctx.rate_limiter
                .acquire_cancellable(slice.len() as u64, &ctx.cancel)
                .await
                .map_err(|_| Error::cancelled())?;
            ctx.sink.write_at(write_offset, slice)?;
            write_offset += slice.len() as u64;
            offset.store(write_offset, Ordering::SeqCst);
            ctx.progress.on_bytes(slice.len() as u64);
        }
    }

    if write_offset <= expected_end {
        debug!(write_offset, expected_end, "partial body, remaining sub-range will be retried");
        return Err(Error::network_message(ctx.url.clone(), "connection closed before chunk completed"));
    }

    Ok(())
}

/// Attaches a parsed `Retry-After` delay to `err` when `headers` carries one
/// (§11 supplemented behavior), otherwise returns `err` unchanged.
fn with_retry_after(err: Error, headers: &HeaderMap) -> Error {
    match headers.get(reqwest::header::RETRY_AFTER).and_then(|v| v.to_str().ok()).and_then(retry::parse_retry_after) {
        Some(delay) => err.with_retry_after(delay),
        None => err,
    }
}

fn content_range_aligns(headers: &HeaderMap, start: u64, end: u64) -> bool {
    let Some(value) = headers.get(reqwest::header::CONTENT_RANGE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(range_part) = value.strip_prefix("bytes ") else { return false };
    let Some((range, _total)) = range_part.split_once('/') else { return false };
    let Some((s, e)) = range.split_once('-') else { return false };
    s.parse::<u64>().ok() == Some(start) && e.parse::<u64>().ok() == Some(end)
}
