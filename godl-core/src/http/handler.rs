//! The HTTP(S) [`ProtocolHandler`] — wires probe → resume decision → plan →
//! transfer → finalize (spec §4.7, §4.8, §4.10 "Flow").

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::Error;
use crate::http::chunked::{self, ChunkedContext};
use crate::http::planner;
use crate::http::probe;
use crate::http::single_stream;
use crate::progress::ProgressReporter;
use crate::rate_limiter::RateLimiter;
use crate::registry::ProtocolHandler;
use crate::request::DownloadRequest;
use crate::resume::{self, ResumeDecision, Sidecar, SidecarProgress};
use crate::retry::RetryPolicy;
use crate::sink::{Sink, SinkOptions};
use crate::stats::DownloadStats;

/// The `http`/`https` [`ProtocolHandler`].
///
/// Composed from [`probe`], [`planner`], [`chunked`], and [`single_stream`]
/// rather than owning the transfer logic itself (spec §9 redesign flag).
pub struct HttpHandler {
    scheme: &'static str,
}

impl HttpHandler {
    #[must_use]
    pub fn new(scheme: &'static str) -> Self {
        Self { scheme }
    }

    #[must_use]
    pub fn http() -> Self {
        Self::new("http")
    }

    #[must_use]
    pub fn https() -> Self {
        Self::new("https")
    }
}

#[async_trait]
impl ProtocolHandler for HttpHandler {
    fn scheme(&self) -> &str {
        self.scheme
    }

    fn can_handle(&self, url: &url::Url) -> bool {
        url.scheme().eq_ignore_ascii_case(self.scheme)
    }

    #[instrument(skip(self, request, cancel), fields(url = %request.url))]
    async fn download(&self, request: &DownloadRequest, cancel: CancellationToken) -> Result<DownloadStats, Error> {
        let start_time = SystemTime::now();

        let outcome = if let Some(timeout) = request.timeout {
            match tokio::time::timeout(timeout, run(request, cancel.clone())).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(Error::timeout(request.url.clone()))
                }
            }
        } else {
            run(request, cancel).await
        };

        let end_time = SystemTime::now();
        let duration = end_time.duration_since(start_time).unwrap_or(Duration::ZERO);

        Ok(match outcome {
            Ok(mut stats) => {
                stats.start_time = start_time;
                stats.end_time = end_time;
                stats.duration = duration;
                stats.average_speed_bps = DownloadStats::average_speed(stats.bytes_downloaded, duration);
                stats
            }
            Err(error) => DownloadStats {
                url: request.url.clone(),
                filename: request.resolved_destination(),
                total_size: -1,
                bytes_downloaded: 0,
                start_time,
                end_time,
                duration,
                average_speed_bps: 0.0,
                retries: 0,
                success: false,
                error: Some(error),
                resumed: false,
                chunks_used: 0,
            },
        })
    }
}

async fn run(request: &DownloadRequest, cancel: CancellationToken) -> Result<DownloadStats, Error> {
    let client = build_client(request)?;
    let headers = build_headers(request)?;

    let info = probe::probe(&client, &request.url, &headers).await?;

    let destination = match (&request.destination, &info.suggested_filename) {
        (None, Some(name)) => PathBuf::from(crate::request::sanitize_filename(name)),
        _ => request.resolved_destination(),
    };

    let existing_size = std::fs::metadata(&destination).ok().map(|m| m.len());
    let existing_sidecar = Sidecar::load(&destination);
    let decision = resume::plan_resume(&destination, existing_size, request.resume, request.overwrite, &info, existing_sidecar)?;

    if let ResumeDecision::StartFresh { existing_must_be_removed: true } = &decision {
        let _ = std::fs::remove_file(&destination);
        let _ = Sidecar::delete(&destination);
    }

    let rate_limiter = Arc::new(RateLimiter::new(request.max_rate_bytes_per_sec));
    let progress = Arc::new(ProgressReporter::new(info.total_size));
    if let Some(callback) = &request.progress_callback {
        let callback = callback.0.clone();
        progress.subscribe(move |update| callback(update));
    }
    let retry_policy = RetryPolicy {
        max_retries: request.max_retries,
        base_delay: request.retry_base_delay,
        max_delay: request.retry_max_delay,
        backoff_factor: request.retry_backoff_factor,
        jitter: request.retry_jitter,
    };

    let resumed = matches!(decision, ResumeDecision::Resume { .. });
    let start_offset = match &decision {
        ResumeDecision::Resume { offset, .. } => *offset,
        ResumeDecision::StartFresh { .. } => 0,
    };

    let use_chunked = start_offset == 0
        && planner::should_chunk(info.total_size, info.supports_ranges, request.concurrency);

    let (bytes_downloaded, chunks_used, retries) = if use_chunked {
        run_chunked(&client, request, &headers, &info, &destination, rate_limiter, progress, retry_policy, cancel.clone()).await?
    } else {
        let sink = if resumed {
            Sink::open_for_resume(&destination)?
        } else {
            Sink::open(&destination, SinkOptions { overwrite: true, create_dirs: request.create_parent_dirs, expected_size: info_size(&info) })?
        };
        let mut stream_headers = headers.clone();
        if resumed {
            if let Some(validator) = info.etag.as_deref().or(info.last_modified.as_deref()) {
                if let Ok(value) = HeaderValue::from_str(validator) {
                    stream_headers.insert(reqwest::header::IF_RANGE, value);
                }
            }
        }

        let sidecar_doc = match &decision {
            ResumeDecision::Resume { sidecar, .. } => sidecar.clone(),
            ResumeDecision::StartFresh { .. } => {
                let mut sidecar = Sidecar::new(request.url.clone(), info.total_size);
                sidecar.etag = info.etag.clone();
                sidecar.last_modified = info.last_modified.clone();
                sidecar
            }
        };
        let sidecar_progress = SidecarProgress::new(sidecar_doc, destination.clone());

        let (written, retries) = match single_stream::execute_with_retry(
            &client,
            &request.url,
            &stream_headers,
            start_offset,
            &sink,
            &rate_limiter,
            &progress,
            &cancel,
            &retry_policy,
            Some(&sidecar_progress),
            info.total_size,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                // Cancellation (or any other terminal failure) still leaves
                // a resumable file behind: fsync what landed and persist the
                // sidecar's latest progress regardless of its save throttle
                // (spec §5 "the sink is flushed but not finalized").
                let _ = sink.flush();
                sidecar_progress.save_now();
                return Err(e);
            }
        };
        sink.finalize()?;
        (written, 1, retries)
    };

    progress.finish();
    let _ = Sidecar::delete(&destination);
    if let Some(lm) = &info.last_modified {
        apply_mtime(&destination, lm);
    }

    info!(bytes_downloaded, chunks_used, resumed, "download complete");

    Ok(DownloadStats {
        url: request.url.clone(),
        filename: destination,
        total_size: info.total_size,
        bytes_downloaded,
        start_time: SystemTime::now(),
        end_time: SystemTime::now(),
        duration: Duration::ZERO,
        average_speed_bps: 0.0,
        retries,
        success: true,
        error: None,
        resumed,
        chunks_used,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_chunked(
    client: &Client,
    request: &DownloadRequest,
    headers: &HeaderMap,
    info: &crate::request::FileInfo,
    destination: &PathBuf,
    rate_limiter: Arc<RateLimiter>,
    progress: Arc<ProgressReporter>,
    retry_policy: RetryPolicy,
    cancel: CancellationToken,
) -> Result<(u64, usize, u32), Error> {
    let total = info.total_size as u64;
    let chunk_size = planner::resolve_chunk_size(total, request.concurrency, request.chunk_size);
    let plan = planner::build_plan(total, chunk_size);

    let sink = Arc::new(Sink::open(
        destination,
        SinkOptions { overwrite: true, create_dirs: request.create_parent_dirs, expected_size: Some(total) },
    )?);

    let mut sidecar = Sidecar::new(request.url.clone(), info.total_size);
    sidecar.etag = info.etag.clone();
    sidecar.last_modified = info.last_modified.clone();
    let sidecar_path = destination.clone();
    let sidecar = Arc::new(tokio::sync::Mutex::new(sidecar));

    let ctx = ChunkedContext {
        client: client.clone(),
        url: request.url.clone(),
        headers: headers.clone(),
        sink: sink.clone(),
        rate_limiter,
        progress,
        retry_policy,
        cancel,
        sidecar_path,
        sidecar,
        retries: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        concurrency: request.concurrency,
    };

    let (chunks_used, retries) = match chunked::execute(ctx, plan).await {
        Ok(result) => result,
        Err(e) => {
            let _ = sink.flush();
            return Err(e);
        }
    };
    let sink = Arc::try_unwrap(sink).map_err(|_| Error::unknown("sink still referenced after chunked transfer"))?;
    sink.finalize()?;
    Ok((total, chunks_used, retries))
}

fn info_size(info: &crate::request::FileInfo) -> Option<u64> {
    if info.total_size >= 0 {
        Some(info.total_size as u64)
    } else {
        None
    }
}

fn build_client(request: &DownloadRequest) -> Result<Client, Error> {
    Client::builder()
        .user_agent(request.user_agent.clone())
        .redirect(redirect_policy(request))
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}

/// Builds the redirect policy, enforcing the `max_redirects` cap and spec
/// §4.7's cross-scheme guard ("on redirect across schemes (`https`→`http`),
/// reject unless an explicit option allows"). `Policy::limited` alone only
/// caps the hop count; it follows a scheme downgrade unconditionally, so the
/// scheme check has to live in a custom policy alongside the cap.
fn redirect_policy(request: &DownloadRequest) -> Policy {
    if request.max_redirects == 0 {
        return Policy::none();
    }
    let max_redirects = request.max_redirects as usize;
    let allow_cross_scheme = request.allow_cross_scheme_redirect;
    let initial_scheme = url::Url::parse(&request.url).map(|u| u.scheme().to_string()).unwrap_or_default();

    Policy::custom(move |attempt| {
        if attempt.previous().len() >= max_redirects {
            return attempt.error("too many redirects");
        }
        if !allow_cross_scheme && attempt.url().scheme() != initial_scheme {
            return attempt.error("redirect changed scheme; allow_cross_scheme_redirect is not set");
        }
        attempt.follow()
    })
}

fn build_headers(request: &DownloadRequest) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(USER_AGENT, HeaderValue::from_str(&request.user_agent).map_err(|e| Error::config(e.to_string()))?);
    for (name, value) in &request.extra_headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::config(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| Error::config(e.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn apply_mtime(path: &std::path::Path, last_modified: &str) {
    let Ok(parsed) = httpdate::parse_http_date(last_modified) else {
        warn!(last_modified, "failed to parse Last-Modified for mtime");
        return;
    };
    let file_time = filetime::FileTime::from_system_time(parsed);
    if let Err(e) = filetime::set_file_mtime(path, file_time) {
        warn!(error = %e, "failed to set destination mtime");
    }
}
