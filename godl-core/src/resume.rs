//! Resume state — decide reuse vs overwrite vs error against a partial file,
//! and the `.godlpart` sidecar that makes that decision durable (spec §4.6).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::Error;
use crate::request::FileInfo;

/// Suffix appended to the destination path for the sidecar file.
pub const SIDECAR_SUFFIX: &str = ".godlpart";

/// One chunk's progress as recorded in the sidecar (spec §6 "Partial file format").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub bytes_written: u64,
}

/// The sidecar document itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sidecar {
    pub version: u32,
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub total_size: i64,
    pub chunks: Vec<ChunkRecord>,
}

impl Sidecar {
    #[must_use]
    pub fn new(url: impl Into<String>, total_size: i64) -> Self {
        Self { version: 1, url: url.into(), etag: None, last_modified: None, total_size, chunks: Vec::new() }
    }

    #[must_use]
    pub fn path_for(target: &Path) -> PathBuf {
        let mut name = target.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        name.push_str(SIDECAR_SUFFIX);
        target.with_file_name(name)
    }

    /// Loads a sidecar next to `target`, returning `None` if absent or
    /// unparsable (a corrupt sidecar is treated as "no sidecar").
    #[must_use]
    pub fn load(target: &Path) -> Option<Self> {
        let path = Self::path_for(target);
        let data = std::fs::read(&path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Writes the sidecar atomically (write-then-rename), per spec §6.
    pub fn save(&self, target: &Path) -> Result<(), Error> {
        let path = Self::path_for(target);
        let tmp = path.with_extension("godlpart.tmp");
        let data = serde_json::to_vec_pretty(self).map_err(|e| Error::storage(path.clone(), std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        std::fs::write(&tmp, data).map_err(|e| Error::storage(path.clone(), e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::storage(path.clone(), e))?;
        Ok(())
    }

    /// Deletes the sidecar, ignoring a missing file (already-deleted is not
    /// an error at finalize time).
    pub fn delete(target: &Path) -> Result<(), Error> {
        let path = Self::path_for(target);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(path, e)),
        }
    }

    pub fn upsert_chunk(&mut self, record: ChunkRecord) {
        if let Some(existing) = self.chunks.iter_mut().find(|c| c.index == record.index) {
            *existing = record;
        } else {
            self.chunks.push(record);
        }
    }
}

/// Minimum interval between sidecar persists once a transfer is underway
/// (spec §6 "Updated atomically... at most every 500ms").
pub const SIDECAR_SAVE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Throttled sidecar persistence for a single sequential transfer (the
/// single-stream path, which has exactly one logical chunk spanning the
/// whole file). Chunked transfers persist per-chunk-completion instead
/// (see `http::chunked::record_chunk_progress`); this exists so a
/// single-stream download that gets cancelled mid-flight still leaves a
/// sidecar with validators and an approximate `bytes_written` behind.
pub struct SidecarProgress {
    sidecar: std::sync::Mutex<Sidecar>,
    target: PathBuf,
    last_save: std::sync::Mutex<std::time::Instant>,
}

impl SidecarProgress {
    #[must_use]
    pub fn new(sidecar: Sidecar, target: PathBuf) -> Self {
        Self { sidecar: std::sync::Mutex::new(sidecar), target, last_save: std::sync::Mutex::new(std::time::Instant::now()) }
    }

    /// Persists immediately, bypassing the throttle. Called once before the
    /// transfer starts so a cancellation before any bytes land still leaves
    /// validators on disk for the next resume decision.
    pub fn save_now(&self) {
        let sidecar = self.sidecar.lock().expect("sidecar mutex poisoned");
        if let Err(e) = sidecar.save(&self.target) {
            debug!(error = %e, "failed to persist sidecar");
        }
        drop(sidecar);
        *self.last_save.lock().expect("sidecar mutex poisoned") = std::time::Instant::now();
    }

    /// Records `bytes_written` against the whole-file chunk record and
    /// persists if `SIDECAR_SAVE_INTERVAL` has elapsed since the last save.
    pub fn update(&self, total_size: i64, bytes_written: u64) {
        let end = if total_size > 0 { (total_size - 1) as u64 } else { 0 };
        {
            let mut sidecar = self.sidecar.lock().expect("sidecar mutex poisoned");
            sidecar.upsert_chunk(ChunkRecord { index: 0, start: 0, end, bytes_written });
        }
        let mut last_save = self.last_save.lock().expect("sidecar mutex poisoned");
        if last_save.elapsed() >= SIDECAR_SAVE_INTERVAL {
            let sidecar = self.sidecar.lock().expect("sidecar mutex poisoned");
            if let Err(e) = sidecar.save(&self.target) {
                debug!(error = %e, "failed to persist sidecar");
            }
            *last_save = std::time::Instant::now();
        }
    }
}

/// What the resume planner decided to do with an existing destination file.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    /// No usable partial state; start at offset 0. `existing_must_be_removed`
    /// is true when a stale file/sidecar needs clearing first.
    StartFresh { existing_must_be_removed: bool },
    /// Resume remaining transfer starting at `offset`.
    Resume { offset: u64, sidecar: Sidecar },
}

/// Decides how to proceed given an existing file size, the `resume` flag,
/// overwrite policy, and the server's current validators (spec §4.6).
#[instrument(skip(info, existing_sidecar), fields(target = %target.display()))]
pub fn plan_resume(
    target: &Path,
    existing_size: Option<u64>,
    resume_requested: bool,
    overwrite: bool,
    info: &FileInfo,
    existing_sidecar: Option<Sidecar>,
) -> Result<ResumeDecision, Error> {
    let Some(existing) = existing_size else {
        return Ok(ResumeDecision::StartFresh { existing_must_be_removed: false });
    };

    if !resume_requested {
        if overwrite {
            return Ok(ResumeDecision::StartFresh { existing_must_be_removed: true });
        }
        return Err(Error::file_exists(target));
    }

    if !info.supports_ranges || (info.size_known() && info.total_size < existing as i64) {
        debug!("server lacks range support or total shrank; discarding partial");
        return Ok(ResumeDecision::StartFresh { existing_must_be_removed: true });
    }

    let Some(sidecar) = existing_sidecar else {
        warn!("partial file present with no sidecar; discarding");
        return Ok(ResumeDecision::StartFresh { existing_must_be_removed: true });
    };

    let etag_matches = match (&sidecar.etag, &info.etag) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        _ => false,
    };
    let lm_matches = match (&sidecar.last_modified, &info.last_modified) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        _ => false,
    };
    if !etag_matches || !lm_matches {
        debug!("validator mismatch; discarding partial");
        return Ok(ResumeDecision::StartFresh { existing_must_be_removed: true });
    }

    Ok(ResumeDecision::Resume { offset: existing, sidecar })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn info(total: i64, supports_ranges: bool) -> FileInfo {
        FileInfo { url: "https://example.com/f".into(), total_size: total, supports_ranges, ..Default::default() }
    }

    #[test]
    fn no_existing_file_starts_fresh() {
        let decision = plan_resume(Path::new("/tmp/x"), None, true, false, &info(100, true), None).unwrap();
        assert_eq!(decision, ResumeDecision::StartFresh { existing_must_be_removed: false });
    }

    #[test]
    fn existing_file_without_resume_and_no_overwrite_errors() {
        let err = plan_resume(Path::new("/tmp/x"), Some(10), false, false, &info(100, true), None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FileExists);
    }

    #[test]
    fn existing_file_without_resume_but_overwrite_restarts() {
        let decision = plan_resume(Path::new("/tmp/x"), Some(10), false, true, &info(100, true), None).unwrap();
        assert_eq!(decision, ResumeDecision::StartFresh { existing_must_be_removed: true });
    }

    #[test]
    fn server_without_ranges_discards_partial() {
        let decision = plan_resume(Path::new("/tmp/x"), Some(10), true, false, &info(100, false), None).unwrap();
        assert_eq!(decision, ResumeDecision::StartFresh { existing_must_be_removed: true });
    }

    #[test]
    fn shrunk_total_discards_partial() {
        let decision = plan_resume(Path::new("/tmp/x"), Some(100), true, false, &info(50, true), None).unwrap();
        assert_eq!(decision, ResumeDecision::StartFresh { existing_must_be_removed: true });
    }

    #[test]
    fn matching_validators_resumes() {
        let mut sidecar = Sidecar::new("https://example.com/f", 100);
        sidecar.etag = Some("abc".to_string());
        let mut file_info = info(100, true);
        file_info.etag = Some("abc".to_string());
        let decision = plan_resume(Path::new("/tmp/x"), Some(50), true, false, &file_info, Some(sidecar)).unwrap();
        assert_eq!(decision, ResumeDecision::Resume { offset: 50, sidecar: Sidecar { version: 1, url: "https://example.com/f".into(), etag: Some("abc".into()), last_modified: None, total_size: 100, chunks: vec![] } });
    }

    #[test]
    fn mismatched_etag_discards_partial() {
        let mut sidecar = Sidecar::new("https://example.com/f", 100);
        sidecar.etag = Some("old".to_string());
        let mut file_info = info(100, true);
        file_info.etag = Some("new".to_string());
        let decision = plan_resume(Path::new("/tmp/x"), Some(50), true, false, &file_info, Some(sidecar)).unwrap();
        assert_eq!(decision, ResumeDecision::StartFresh { existing_must_be_removed: true });
    }

    #[test]
    fn missing_sidecar_with_partial_file_discards() {
        let decision = plan_resume(Path::new("/tmp/x"), Some(50), true, false, &info(100, true), None).unwrap();
        assert_eq!(decision, ResumeDecision::StartFresh { existing_must_be_removed: true });
    }
}
