//! Progress reporter — fan-in of per-worker byte counters (spec §4.3).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::instrument;

/// Default interval between callback invocations.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Window over which the EMA smooths instantaneous speed.
const EMA_WINDOW: Duration = Duration::from_secs(1);

/// A progress snapshot delivered to subscribers.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub bytes_downloaded: u64,
    /// `-1` when unknown.
    pub total_size: i64,
    pub speed_bps: f64,
    /// Set only on the terminal update (spec §4.3 "finish event").
    pub finished: bool,
}

impl ProgressUpdate {
    #[must_use]
    pub fn percentage(&self) -> Option<f64> {
        if self.total_size < 0 {
            return None;
        }
        if self.total_size == 0 {
            return Some(100.0);
        }
        Some((self.bytes_downloaded as f64 / self.total_size as f64) * 100.0)
    }
}

/// JSON-serializable line for `--progress-bar json` (spec §6).
#[derive(Debug, Serialize)]
pub struct ProgressJsonLine<'a> {
    pub filename: &'a str,
    pub total_size: i64,
    pub bytes_downloaded: u64,
    pub speed: f64,
    pub percentage: f64,
}

type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

struct Ema {
    value: f64,
    last_sample: Option<(Instant, u64)>,
}

impl Ema {
    fn new() -> Self {
        Self { value: 0.0, last_sample: None }
    }

    fn sample(&mut self, total_bytes: u64, now: Instant) -> f64 {
        match self.last_sample {
            None => {
                self.last_sample = Some((now, total_bytes));
                0.0
            }
            Some((last_time, last_bytes)) => {
                let dt = now.saturating_duration_since(last_time).as_secs_f64();
                self.last_sample = Some((now, total_bytes));
                if dt <= 0.0 {
                    return self.value;
                }
                let instantaneous = (total_bytes.saturating_sub(last_bytes)) as f64 / dt;
                let alpha = (dt / EMA_WINDOW.as_secs_f64()).min(1.0);
                self.value = alpha * instantaneous + (1.0 - alpha) * self.value;
                self.value
            }
        }
    }
}

/// Thread-safe fan-in point for worker byte counts.
///
/// Workers call [`Self::on_bytes`] from any task; subscribers registered via
/// [`Self::subscribe`] are invoked at most once per [`DEFAULT_REFRESH_INTERVAL`]
/// — intermediate updates are coalesced so a slow callback never stalls
/// downloading (spec §4.3).
pub struct ProgressReporter {
    bytes_downloaded: AtomicU64,
    total_size: AtomicI64,
    refresh_interval: Duration,
    ema: Mutex<Ema>,
    last_emit: Mutex<Option<Instant>>,
    callbacks: Mutex<Vec<ProgressCallback>>,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(total_size: i64) -> Self {
        Self::with_refresh_interval(total_size, DEFAULT_REFRESH_INTERVAL)
    }

    #[must_use]
    pub fn with_refresh_interval(total_size: i64, refresh_interval: Duration) -> Self {
        Self {
            bytes_downloaded: AtomicU64::new(0),
            total_size: AtomicI64::new(total_size),
            refresh_interval,
            ema: Mutex::new(Ema::new()),
            last_emit: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback invoked on each (rate-limited) update and on the
    /// terminal finish event.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.callbacks.lock().expect("progress mutex poisoned").push(Box::new(callback));
    }

    /// Updates the known total size, e.g. once a HEAD probe resolves it.
    pub fn set_total_size(&self, total_size: i64) {
        self.total_size.store(total_size, Ordering::Relaxed);
    }

    #[must_use]
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_size(&self) -> i64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Records bytes written by a worker and emits a coalesced update if the
    /// refresh interval has elapsed.
    #[instrument(skip(self), fields(delta))]
    pub fn on_bytes(&self, delta: u64) {
        let total = self.bytes_downloaded.fetch_add(delta, Ordering::Relaxed) + delta;
        self.maybe_emit(total, false);
    }

    /// Emits the terminal update unconditionally, bypassing the refresh
    /// interval throttle (spec §4.3 "a terminal finish event is always
    /// delivered").
    pub fn finish(&self) {
        let total = self.bytes_downloaded.load(Ordering::Relaxed);
        self.emit(total, true);
    }

    fn maybe_emit(&self, bytes_downloaded: u64, finished: bool) {
        let now = Instant::now();
        let should_emit = {
            let mut last = self.last_emit.lock().expect("progress mutex poisoned");
            match *last {
                Some(t) if now.saturating_duration_since(t) < self.refresh_interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if should_emit || finished {
            self.emit(bytes_downloaded, finished);
        }
    }

    fn emit(&self, bytes_downloaded: u64, finished: bool) {
        let now = Instant::now();
        let speed = self.ema.lock().expect("progress mutex poisoned").sample(bytes_downloaded, now);
        let update = ProgressUpdate {
            bytes_downloaded,
            total_size: self.total_size(),
            speed_bps: speed,
            finished,
        };
        for cb in self.callbacks.lock().expect("progress mutex poisoned").iter() {
            cb(update);
        }
    }
}

/// Shareable alias used across worker tasks.
pub type SharedProgressReporter = Arc<ProgressReporter>;
