//! CLI argument definitions using clap derive macros (spec §6).

use std::time::Duration;

use clap::{Parser, ValueEnum};
use godl_core::request::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};

/// General-purpose file downloader.
#[derive(Parser, Debug)]
#[command(name = "godl")]
#[command(author, version, about)]
pub struct Args {
    /// URL of the file to download.
    pub url: String,

    /// Destination path (default: derived from the URL's last path segment).
    #[arg(short, long)]
    pub output: Option<String>,

    /// Overwrite the destination if it already exists.
    #[arg(long)]
    pub force: bool,

    /// Create missing parent directories for the destination.
    #[arg(long)]
    pub create_dirs: bool,

    /// Resume a previously interrupted download.
    #[arg(long)]
    pub resume: bool,

    /// Suppress non-error output.
    #[arg(short, long)]
    pub quiet: bool,

    /// Increase output verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// User-Agent header to send.
    #[arg(long, default_value = godl_core::request::DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Total download timeout (e.g. `30m`, `1h`, `90s`).
    #[arg(long, value_parser = parse_duration, default_value = "30m")]
    pub timeout: Duration,

    /// Number of concurrent range workers (1-32).
    #[arg(
        long = "concurrent",
        default_value_t = DEFAULT_CONCURRENCY as u32,
        value_parser = clap::value_parser!(u32).range(1..=32)
    )]
    pub concurrent: u32,

    /// Disable concurrent chunking; always use a single stream.
    #[arg(long)]
    pub no_concurrent: bool,

    /// Chunk size: `auto` or `<N>[B|KB|MB|GB]`.
    #[arg(long, default_value = "auto")]
    pub chunk_size: String,

    /// Maximum transfer rate, `<N>[B|KB|MB|GB][/s]`; `0` is unlimited.
    #[arg(long, default_value = "0")]
    pub max_rate: String,

    /// Maximum retry attempts for transient failures.
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Display language for user-facing text.
    #[arg(long, value_enum, default_value_t = Language::En)]
    pub language: Language,

    /// Disable colored output.
    #[arg(long)]
    pub no_color: bool,

    /// Progress rendering style.
    #[arg(long, value_enum, default_value_t = ProgressStyle::Detailed)]
    pub progress_bar: ProgressStyle,

    /// Probe connectivity before starting (advisory; out of engine scope).
    #[arg(long)]
    pub check_connectivity: bool,

    /// Probe available disk space before starting (advisory).
    #[arg(long)]
    pub check_space: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Language {
    En,
    Ja,
    Es,
    Fr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgressStyle {
    Detailed,
    Simple,
    Json,
}

impl Args {
    /// Resolves effective concurrency, honoring `--no-concurrent` (spec §6:
    /// `concurrent=1` behaves as single-stream, spec §8 boundary).
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        if self.no_concurrent {
            1
        } else {
            self.concurrent as usize
        }
    }

    /// Parses `--chunk-size` into a [`godl_core::ChunkSizePolicy`].
    pub fn parse_chunk_size(&self) -> Result<godl_core::ChunkSizePolicy, String> {
        if self.chunk_size.eq_ignore_ascii_case("auto") {
            return Ok(godl_core::ChunkSizePolicy::Auto);
        }
        parse_byte_size(&self.chunk_size).map(godl_core::ChunkSizePolicy::Explicit)
    }

    /// Parses `--max-rate` into bytes/sec, accepting an optional `/s` suffix.
    pub fn parse_max_rate(&self) -> Result<u64, String> {
        let trimmed = self.max_rate.trim_end_matches("/s").trim_end_matches("/S");
        parse_byte_size(trimmed)
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Parses `<N>[B|KB|MB|GB]`, case-insensitively, with powers-of-1024 units.
fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("size must not be empty".to_string());
    }
    let lower = s.to_ascii_lowercase();
    let (digits, multiplier) = if let Some(n) = lower.strip_suffix("gb") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid size: {s}"))
}

/// Default timeout used when `--timeout` isn't supplied interactively
/// (kept in sync with [`godl_core::request::DEFAULT_TIMEOUT`]).
#[must_use]
pub fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_url_positional() {
        let args = Args::try_parse_from(["godl", "https://example.com/f.bin"]).unwrap();
        assert_eq!(args.url, "https://example.com/f.bin");
    }

    #[test]
    fn missing_url_is_a_usage_error() {
        let result = Args::try_parse_from(["godl"]);
        assert!(result.is_err());
    }

    #[test]
    fn verbose_flag_increments_count() {
        let args = Args::try_parse_from(["godl", "-vv", "https://example.com/f"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn concurrent_zero_is_rejected() {
        let result = Args::try_parse_from(["godl", "--concurrent", "0", "https://example.com/f"]);
        assert!(result.is_err());
    }

    #[test]
    fn concurrent_over_max_is_rejected() {
        let result = Args::try_parse_from(["godl", "--concurrent", "33", "https://example.com/f"]);
        assert!(result.is_err());
    }

    #[test]
    fn timeout_accepts_human_durations() {
        let args = Args::try_parse_from(["godl", "--timeout", "90s", "https://example.com/f"]).unwrap();
        assert_eq!(args.timeout, Duration::from_secs(90));

        let args = Args::try_parse_from(["godl", "--timeout", "1h", "https://example.com/f"]).unwrap();
        assert_eq!(args.timeout, Duration::from_secs(3600));
    }

    #[test]
    fn default_timeout_is_30_minutes() {
        let args = Args::try_parse_from(["godl", "https://example.com/f"]).unwrap();
        assert_eq!(args.timeout, Duration::from_secs(30 * 60));
    }

    #[test]
    fn chunk_size_auto_parses_to_auto_policy() {
        let args = Args::try_parse_from(["godl", "https://example.com/f"]).unwrap();
        assert_eq!(args.parse_chunk_size().unwrap(), godl_core::ChunkSizePolicy::Auto);
    }

    #[test]
    fn chunk_size_explicit_parses_suffix() {
        let mut args = Args::try_parse_from(["godl", "https://example.com/f"]).unwrap();
        args.chunk_size = "256KB".to_string();
        assert_eq!(args.parse_chunk_size().unwrap(), godl_core::ChunkSizePolicy::Explicit(262_144));
    }

    #[test]
    fn max_rate_zero_is_unlimited() {
        let args = Args::try_parse_from(["godl", "https://example.com/f"]).unwrap();
        assert_eq!(args.parse_max_rate().unwrap(), 0);
    }

    #[test]
    fn max_rate_accepts_slash_s_suffix() {
        let mut args = Args::try_parse_from(["godl", "https://example.com/f"]).unwrap();
        args.max_rate = "10MB/s".to_string();
        assert_eq!(args.parse_max_rate().unwrap(), 10 * 1024 * 1024);
    }

    #[test]
    fn effective_concurrency_forces_one_with_no_concurrent() {
        let mut args = Args::try_parse_from(["godl", "https://example.com/f"]).unwrap();
        args.no_concurrent = true;
        assert_eq!(args.effective_concurrency(), 1);
    }

    #[test]
    fn quiet_and_verbose_flags_parse() {
        let args = Args::try_parse_from(["godl", "-q", "https://example.com/f"]).unwrap();
        assert!(args.quiet);
    }
}
