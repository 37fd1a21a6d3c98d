//! Download request and option normalization (spec §3, §4.10).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::progress::ProgressUpdate;

/// Default user agent sent when the caller doesn't override it.
pub const DEFAULT_USER_AGENT: &str = concat!("godl/", env!("CARGO_PKG_VERSION"));

/// Default total-download timeout (30 minutes).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default number of retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default worker concurrency for chunked transfers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Hard ceiling on worker concurrency (spec §3: `concurrency (1..32)`).
pub const MAX_CONCURRENCY: usize = 32;

/// Minimum chunk size under which chunked transfer is not attempted (1 MiB).
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Cap on an auto-computed chunk size (64 MiB).
pub const MAX_AUTO_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Chunk-size policy: either let the planner compute one, or pin it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSizePolicy {
    Auto,
    Explicit(u64),
}

/// A caller-supplied progress sink (spec §3 "progress callback").
///
/// Wraps the callback in `Arc` so `DownloadRequest` stays cheaply `Clone`,
/// and provides a manual `Debug` impl since trait objects aren't `Debug`.
#[derive(Clone)]
pub struct ProgressCallback(pub Arc<dyn Fn(ProgressUpdate) + Send + Sync>);

impl ProgressCallback {
    #[must_use]
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl std::fmt::Debug for ProgressCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProgressCallback(..)")
    }
}

/// Input to a single download (spec §3 "Download request").
///
/// Immutable once passed to [`crate::Downloader::download`] — nothing in
/// the engine mutates a `DownloadRequest` in place.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: Option<PathBuf>,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_backoff_factor: f64,
    pub retry_jitter: bool,
    pub concurrency: usize,
    pub chunk_size: ChunkSizePolicy,
    pub overwrite: bool,
    pub create_parent_dirs: bool,
    pub resume: bool,
    pub max_rate_bytes_per_sec: u64,
    pub extra_headers: Vec<(String, String)>,
    pub max_redirects: u32,
    pub allow_cross_scheme_redirect: bool,
    pub progress_callback: Option<ProgressCallback>,
}

impl DownloadRequest {
    /// Starts building a request for `url` with every other field defaulted.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Some(DEFAULT_TIMEOUT),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: Duration::from_secs(32),
            retry_backoff_factor: 2.0,
            retry_jitter: true,
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: ChunkSizePolicy::Auto,
            overwrite: false,
            create_parent_dirs: false,
            resume: false,
            max_rate_bytes_per_sec: 0,
            extra_headers: Vec::new(),
            max_redirects: 10,
            allow_cross_scheme_redirect: false,
            progress_callback: None,
        }
    }

    /// Registers a callback invoked on each progress update (spec §3, §4.3).
    #[must_use]
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_callback = Some(ProgressCallback::new(callback));
        self
    }

    /// Sets an extra header, last-wins semantics if called repeatedly for the
    /// same name (spec §3 "extra headers (ordered map, last-wins)").
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.extra_headers.retain(|(n, _)| n != &name);
        self.extra_headers.push((name, value.into()));
        self
    }

    /// Validates and clamps the request, returning an error for values that
    /// cannot be normalized (e.g. an empty URL), matching the facade's
    /// option-normalization responsibility in spec §4.10.
    pub fn normalize(mut self) -> Result<Self, Error> {
        if self.url.trim().is_empty() {
            return Err(Error::invalid_url(self.url));
        }
        url::Url::parse(&self.url).map_err(|e| {
            Error::invalid_url(self.url.clone()).with_details(e.to_string())
        })?;

        self.concurrency = self.concurrency.clamp(1, MAX_CONCURRENCY);
        if let ChunkSizePolicy::Explicit(n) = self.chunk_size {
            if n == 0 {
                return Err(Error::validation("chunk size must be at least 1 byte"));
            }
        }
        if self.user_agent.trim().is_empty() {
            self.user_agent = DEFAULT_USER_AGENT.to_string();
        }
        Ok(self)
    }

    /// Resolves the destination path, deriving one from the URL's last path
    /// segment when the caller didn't supply one (spec §3).
    #[must_use]
    pub fn resolved_destination(&self) -> PathBuf {
        if let Some(path) = &self.destination {
            return path.clone();
        }
        filename_from_url(&self.url)
    }
}

/// Derives a filename from a URL's final path segment, falling back to
/// `download` when the URL has no usable segment (spec §3 default).
#[must_use]
pub fn filename_from_url(url: &str) -> PathBuf {
    let name = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "download".to_string());
    PathBuf::from(sanitize_filename(&name))
}

/// Strips path-traversal and reserved characters from a candidate filename
/// (grounded in the teacher's `filename::sanitize_filename_component`).
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let mut out = String::new();
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            c if c.is_control() => out.push('_'),
            c => out.push(c),
        }
    }
    if out.trim_matches('.').is_empty() {
        "download".to_string()
    } else {
        out
    }
}

/// Response of a HEAD/probe step (spec §3 "File info").
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub url: String,
    /// Total size in bytes, or `-1` when unknown.
    pub total_size: i64,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
    pub suggested_filename: Option<String>,
    pub supports_ranges: bool,
    pub etag: Option<String>,
    pub headers: HashMap<String, String>,
}

impl FileInfo {
    #[must_use]
    pub fn size_known(&self) -> bool {
        self.total_size >= 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_empty_url() {
        let req = DownloadRequest::new("");
        assert!(req.normalize().is_err());
    }

    #[test]
    fn normalize_rejects_malformed_url() {
        let req = DownloadRequest::new("not a url");
        assert!(req.normalize().is_err());
    }

    #[test]
    fn normalize_clamps_concurrency() {
        let mut req = DownloadRequest::new("https://example.com/f.bin");
        req.concurrency = 1000;
        let req = req.normalize().unwrap();
        assert_eq!(req.concurrency, MAX_CONCURRENCY);
    }

    #[test]
    fn resolved_destination_derives_from_url() {
        let req = DownloadRequest::new("https://example.com/path/to/file.zip");
        assert_eq!(req.resolved_destination(), PathBuf::from("file.zip"));
    }

    #[test]
    fn resolved_destination_falls_back_to_download() {
        let req = DownloadRequest::new("https://example.com/");
        assert_eq!(req.resolved_destination(), PathBuf::from("download"));
    }

    #[test]
    fn with_header_last_wins() {
        let req = DownloadRequest::new("https://example.com/f")
            .with_header("X-Test", "a")
            .with_header("X-Test", "b");
        assert_eq!(req.extra_headers, vec![("X-Test".to_string(), "b".to_string())]);
    }

    #[test]
    fn sanitize_filename_strips_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
    }

    #[test]
    fn sanitize_filename_replaces_reserved_chars() {
        assert_eq!(sanitize_filename("weird:name?.txt"), "weird_name_.txt");
    }
}
