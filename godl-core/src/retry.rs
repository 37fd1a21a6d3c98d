//! Retry executor — drives an idempotent operation with backoff (spec §4.2).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, ErrorKind};

/// Backoff policy for a retried operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(32),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Computes the nominal (pre-jitter) delay before `attempt` (0-based).
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled).min(self.max_delay)
    }

    /// Computes the actual delay to sleep before `attempt`, applying jitter
    /// uniformly in `[delay/2, delay]` when enabled (spec §4.2 step 4).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter {
            return nominal;
        }
        let half = nominal.as_secs_f64() / 2.0;
        let full = nominal.as_secs_f64();
        if full <= 0.0 {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(half..=full);
        Duration::from_secs_f64(secs)
    }
}

/// Upper bound on a parsed `Retry-After` value, to keep a misbehaving server
/// from stalling a download indefinitely (grounded in the teacher's
/// `rate_limiter::MAX_RETRY_AFTER`).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a `Retry-After` header value (§11 supplemented behavior).
///
/// Accepts both RFC 7231 forms: integer seconds (`"120"`) and an HTTP-date
/// (`"Wed, 21 Oct 2025 07:28:00 GMT"`). Returns `None` for anything else,
/// including a negative integer. Values beyond an hour are capped.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        return Some(duration.min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        return match datetime.duration_since(now) {
            Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
            Err(_) => Some(Duration::ZERO),
        };
    }

    None
}

/// Outcome of [`execute_with_stats`]: attempts taken, total delay slept, and
/// the last error observed (present only on failure).
#[derive(Debug, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub last_error: Option<Error>,
}

/// Runs `op` under `policy`, retrying retryable failures with backoff.
///
/// `op` must be idempotent: the executor may call it `max_retries + 1` times.
/// Cancellation via `cancel` is honored both between attempts and during the
/// backoff sleep (spec §5 "Honor cancellation during sleep").
#[instrument(skip(op, policy, cancel))]
pub async fn execute<T, F, Fut>(
    mut op: F,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let (result, _) = execute_with_stats(op_fn(&mut op), policy, cancel).await;
    result
}

/// Like [`execute`] but also returns [`RetryStats`] (spec §4.2 "Stats variant").
pub async fn execute_with_stats<T, F, Fut>(
    mut op: F,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> (Result<T, Error>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut stats = RetryStats::default();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return (Err(Error::cancelled()), stats);
        }

        match op().await {
            Ok(value) => return (Ok(value), stats),
            Err(err) => {
                let retryable = err.retryable();
                if !retryable || attempt >= policy.max_retries {
                    debug!(
                        attempt,
                        retryable,
                        max_retries = policy.max_retries,
                        "retry executor surfacing final error"
                    );
                    let final_err = if retryable {
                        err.mark_attempts_exhausted()
                    } else {
                        err
                    };
                    stats.last_error = Some(final_err.clone());
                    return (Err(final_err), stats);
                }

                // A server-mandated Retry-After (§11) overrides the computed
                // backoff outright rather than just seeding it, but never
                // beyond the policy's own ceiling.
                let delay = match err.retry_after() {
                    Some(retry_after) => retry_after.min(policy.max_delay),
                    None => policy.delay_for_attempt(attempt),
                };
                warn!(
                    attempt,
                    ?delay,
                    kind = ?err.kind(),
                    "retrying after failure"
                );
                stats.attempts += 1;
                stats.total_delay += delay;

                tokio::select! {
                    () = cancel.cancelled() => return (Err(Error::cancelled()), stats),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Adapts a `&mut FnMut` into an owned-by-reference closure usable from both
/// [`execute`] and [`execute_with_stats`] without duplicating the loop body.
fn op_fn<F, Fut>(f: &mut F) -> impl FnMut() -> Fut + '_
where
    F: FnMut() -> Fut,
{
    move || f()
}

/// Default classification table for error kinds (spec §7).
///
/// `ErrorKind::default_retryable` implements this directly; this free
/// function exists for callers that only have a kind, not a constructed
/// [`Error`] (e.g. classifying a raw HTTP status before wrapping it).
#[must_use]
pub fn is_retryable_kind(kind: ErrorKind) -> bool {
    kind.default_retryable()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let calls2 = calls.clone();
        let result = execute(
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(42)
                }
            },
            &policy(false),
            &cancel,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let calls2 = calls.clone();
        let (result, stats) = execute_with_stats(
            move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::timeout("https://example.com/f"))
                    } else {
                        Ok::<_, Error>(99)
                    }
                }
            },
            &policy(false),
            &cancel,
        )
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(stats.attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_surfaces_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let calls2 = calls.clone();
        let result = execute(
            move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::file_not_found("https://x/y"))
                }
            },
            &policy(false),
            &cancel,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retryable_preserves_kind_and_marks_exhausted() {
        let cancel = CancellationToken::new();
        let result = execute(
            || async { Err::<(), _>(Error::timeout("https://example.com/f")) },
            &policy(false),
            &cancel,
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.attempts_exhausted());
    }

    #[test]
    fn nominal_delay_respects_cap() {
        let p = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(p.nominal_delay(0), Duration::from_secs(1));
        assert_eq!(p.nominal_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn parse_retry_after_accepts_integer_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn parse_retry_after_rejects_negative_and_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("banana"), None);
    }

    #[test]
    fn parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_computed_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let (result, stats) = execute_with_stats(
            move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(Error::http_status("https://example.com/f", 429).with_retry_after(Duration::from_millis(50)))
                    } else {
                        Ok::<_, Error>(1)
                    }
                }
            },
            &policy(false),
            &cancel,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(stats.total_delay, Duration::from_millis(50));
    }

    #[test]
    fn jitter_stays_within_half_to_full_range() {
        let p = policy(true);
        let nominal = p.nominal_delay(2);
        for _ in 0..50 {
            let d = p.delay_for_attempt(2);
            assert!(d >= nominal / 2 && d <= nominal, "{d:?} out of range for {nominal:?}");
        }
    }
}
