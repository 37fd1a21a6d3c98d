//! Download stats — the output record of a single download (spec §3).

use std::time::{Duration, SystemTime};

use crate::error::Error;

/// Outcome of a single download, returned by [`crate::Downloader::download`]
/// regardless of success or failure.
#[derive(Debug)]
pub struct DownloadStats {
    pub url: String,
    pub filename: std::path::PathBuf,
    /// `-1` when the size was never known.
    pub total_size: i64,
    pub bytes_downloaded: u64,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub duration: Duration,
    pub average_speed_bps: f64,
    pub retries: u32,
    pub success: bool,
    pub error: Option<Error>,
    pub resumed: bool,
    pub chunks_used: usize,
}

impl DownloadStats {
    #[must_use]
    pub(crate) fn average_speed(bytes: u64, duration: Duration) -> f64 {
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            bytes as f64 / secs
        }
    }
}
