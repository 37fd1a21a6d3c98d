//! Error types for the download engine.
//!
//! A single closed-set [`ErrorKind`] drives retry and exit-code decisions;
//! [`Error`] attaches whatever context (url, filename, HTTP status, cause)
//! was available where the error originated.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Closed set of error classifications used throughout the engine.
///
/// Retryability is a property of the kind (see [`ErrorKind::is_retryable`]),
/// not of the message text — string-sniffing an error to decide whether to
/// retry is exactly the ambiguity this spec rules out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidUrl,
    InvalidPath,
    FileExists,
    FileNotFound,
    NetworkError,
    Timeout,
    PermissionDenied,
    InsufficientSpace,
    AuthenticationFailed,
    ServerError,
    ValidationError,
    ConfigError,
    StorageError,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Whether an error of this kind should, in general, be retried.
    ///
    /// HTTP status code nuance (408/429 are retryable, other 4xx are not)
    /// lives in [`Error::retryable`], which overrides this default for
    /// [`ErrorKind::ServerError`] built from a status code.
    #[must_use]
    pub fn default_retryable(self) -> bool {
        matches!(self, Self::NetworkError | Self::Timeout | Self::ServerError)
    }

    /// Short machine-readable label, used for metrics bucketing (spec §4.4).
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidPath => "invalid_path",
            Self::FileExists => "file_exists",
            Self::FileNotFound => "not_found",
            Self::NetworkError => "network",
            Self::Timeout => "timeout",
            Self::PermissionDenied => "permission",
            Self::InsufficientSpace => "disk_space",
            Self::AuthenticationFailed => "unauthorized",
            Self::ServerError => "server_error",
            Self::ValidationError => "validation",
            Self::ConfigError => "config",
            Self::StorageError => "storage",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

/// An error produced anywhere in the download pipeline.
///
/// Carries enough context (`url`, `filename`, `http_status`) to render the
/// user-visible `ERROR: ...` / `Details: ...` format from spec §7 without
/// re-parsing the message string.
#[derive(Debug, Error)]
#[error("{kind_message}")]
pub struct Error {
    kind: ErrorKind,
    kind_message: String,
    details: Option<String>,
    url: Option<String>,
    filename: Option<PathBuf>,
    http_status: Option<u16>,
    retryable: bool,
    /// Set by the retry executor when a retryable error's final attempt was
    /// still exhausted — the original `kind` is preserved (§4.2 design note),
    /// this just flags that retries were attempted and ran out.
    attempts_exhausted: bool,
    /// Server-mandated cool-down parsed from a `Retry-After` header on a 429
    /// response (§11 supplemented behavior). When set, the retry executor
    /// prefers this over the computed exponential backoff, still capped at
    /// `max_delay`.
    retry_after: Option<Duration>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Clone for Error {
    /// Clones everything but `cause` — the boxed source isn't `Clone`, and
    /// callers that need the original (e.g. retry stats snapshots) don't
    /// need the full diagnostic chain twice.
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            kind_message: self.kind_message.clone(),
            details: self.details.clone(),
            url: self.url.clone(),
            filename: self.filename.clone(),
            http_status: self.http_status,
            retryable: self.retryable,
            attempts_exhausted: self.attempts_exhausted,
            retry_after: self.retry_after,
            cause: None,
        }
    }
}

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = kind.default_retryable();
        Self {
            kind,
            kind_message: message.into(),
            details: None,
            url: None,
            filename: None,
            http_status: None,
            retryable,
            attempts_exhausted: false,
            retry_after: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    #[must_use]
    pub fn filename(&self) -> Option<&PathBuf> {
        self.filename.as_ref()
    }

    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    #[must_use]
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_exhausted
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub(crate) fn mark_attempts_exhausted(mut self) -> Self {
        self.attempts_exhausted = true;
        self
    }

    /// Attaches a server-mandated cool-down parsed from `Retry-After`
    /// (§11 supplemented behavior).
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn invalid_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ErrorKind::InvalidUrl, format!("invalid URL: {url}")).with_url(url)
    }

    #[must_use]
    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(
            ErrorKind::InvalidPath,
            format!("invalid path {}: {}", path.display(), reason.into()),
        )
        .with_filename(path)
    }

    #[must_use]
    pub fn file_exists(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(ErrorKind::FileExists, format!("file already exists: {}", path.display()))
            .with_filename(path)
    }

    #[must_use]
    pub fn file_not_found(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ErrorKind::FileNotFound, format!("not found: {url}")).with_url(url)
    }

    #[must_use]
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        Self::new(ErrorKind::NetworkError, format!("network error downloading {url}: {source}"))
            .with_url(url)
            .with_cause(source)
    }

    /// Builds a network error without an underlying transport `cause` —
    /// used when the engine itself detects a network-class failure (e.g. a
    /// stream ending short of the expected range) rather than wrapping a
    /// `reqwest::Error`.
    #[must_use]
    pub fn network_message(url: impl Into<String>, message: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ErrorKind::NetworkError, message.into()).with_url(url)
    }

    #[must_use]
    pub fn timeout(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ErrorKind::Timeout, format!("timeout downloading {url}")).with_url(url)
    }

    #[must_use]
    pub fn permission_denied(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::new(
            ErrorKind::PermissionDenied,
            format!("permission denied: {}", path.display()),
        )
        .with_filename(path)
    }

    #[must_use]
    pub fn insufficient_space(path: impl Into<PathBuf>, needed: u64, available: u64) -> Self {
        let path = path.into();
        Self::new(
            ErrorKind::InsufficientSpace,
            format!(
                "insufficient space writing {}: need {needed} bytes, {available} available",
                path.display()
            ),
        )
        .with_filename(path)
    }

    #[must_use]
    pub fn authentication_failed(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        Self::new(
            ErrorKind::AuthenticationFailed,
            format!("authentication failed (HTTP {status}) for {url}"),
        )
        .with_url(url)
        .with_http_status(status)
    }

    /// Builds a server-error from an HTTP status, applying the retryable
    /// status-code table from spec §7: 5xx, 408, and 429 are retryable.
    #[must_use]
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        let mut err = Self::new(ErrorKind::ServerError, format!("HTTP {status} downloading {url}"))
            .with_url(url)
            .with_http_status(status);
        err.retryable = matches!(status, 408 | 429) || (500..600).contains(&status);
        err
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message.into())
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, message.into())
    }

    #[must_use]
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::permission_denied(path).with_cause(source);
        }
        let mut err = Self::new(
            ErrorKind::StorageError,
            format!("storage error writing {}: {source}", path.display()),
        )
        .with_filename(path)
        .with_cause(source);
        err.retryable = false;
        err
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "download cancelled".to_string())
    }

    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message.into())
    }

    fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Renders the user-visible, non-quiet format from spec §7.
    ///
    /// `verbose` additionally includes `Details:`, `URL:`, and `HTTP Status:`
    /// lines when that information is present.
    #[must_use]
    pub fn display_for_user(&self, verbose: bool) -> String {
        let mut out = format!("ERROR: {}", self.kind_message);
        if verbose {
            if let Some(details) = &self.details {
                out.push_str(&format!("\nDetails: {details}"));
            }
            if let Some(url) = &self.url {
                out.push_str(&format!("\nURL: {url}"));
            }
            if let Some(status) = self.http_status {
                out.push_str(&format!("\nHTTP Status: {status}"));
            }
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn http_status_5xx_is_retryable() {
        let e = Error::http_status("http://example.com", 503);
        assert!(e.retryable());
        assert_eq!(e.kind(), ErrorKind::ServerError);
    }

    #[test]
    fn http_status_404_is_not_retryable() {
        let e = Error::http_status("http://example.com", 404);
        assert!(!e.retryable());
    }

    #[test]
    fn http_status_429_is_retryable() {
        let e = Error::http_status("http://example.com", 429);
        assert!(e.retryable());
    }

    #[test]
    fn http_status_408_is_retryable() {
        let e = Error::http_status("http://example.com", 408);
        assert!(e.retryable());
    }

    #[test]
    fn invalid_url_is_not_retryable() {
        let e = Error::invalid_url("not a url");
        assert!(!e.retryable());
        assert_eq!(e.kind(), ErrorKind::InvalidUrl);
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!Error::cancelled().retryable());
    }

    #[test]
    fn display_for_user_non_verbose_hides_context() {
        let e = Error::http_status("https://example.com/f", 500).with_details("probe failed");
        let msg = e.display_for_user(false);
        assert!(msg.starts_with("ERROR:"));
        assert!(!msg.contains("Details:"));
        assert!(!msg.contains("URL:"));
    }

    #[test]
    fn display_for_user_verbose_includes_context() {
        let e = Error::http_status("https://example.com/f", 500).with_details("probe failed");
        let msg = e.display_for_user(true);
        assert!(msg.contains("Details: probe failed"));
        assert!(msg.contains("URL: https://example.com/f"));
        assert!(msg.contains("HTTP Status: 500"));
    }

    #[test]
    fn mark_attempts_exhausted_preserves_kind() {
        let e = Error::http_status("https://example.com/f", 503).mark_attempts_exhausted();
        assert_eq!(e.kind(), ErrorKind::ServerError);
        assert!(e.attempts_exhausted());
    }

    #[test]
    fn storage_error_permission_denied_reclassifies() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let e = Error::storage("/tmp/out.bin", io);
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
    }
}
