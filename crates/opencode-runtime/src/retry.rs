use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// First backoff step.
pub const INITIAL_DELAY_MS: u64 = 2_000;
/// Exponential growth factor per attempt.
pub const BACKOFF_FACTOR: u32 = 2;
/// Cap applied only when the error carried no response headers at all.
pub const HEADERLESS_CAP_MS: u64 = 30_000;
/// Wall-clock budget for the bounded variant.
pub const DEFAULT_MAX_DURATION_MS: u64 = 600_000;

/// Upstream API failure as seen by the retry controller: just the response
/// headers, when the transport produced any.
#[derive(Debug, Clone, Default)]
pub struct ApiError {
    pub response_headers: Option<BTreeMap<String, String>>,
}

impl ApiError {
    pub fn with_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            response_headers: Some(
                headers
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

/// Next delay in milliseconds for a 1-based `attempt`.
///
/// Server hints win over local backoff: `retry-after-ms` verbatim, then
/// `retry-after` as seconds or an HTTP-date. With headers present but no
/// usable hint the exponential backoff is uncapped; only the fully
/// headerless case is capped at [`HEADERLESS_CAP_MS`]. The asymmetry is
/// deliberate and part of the contract.
pub fn delay_ms(error: &ApiError, attempt: u32) -> u64 {
    let Some(headers) = &error.response_headers else {
        return backoff_ms(attempt).min(HEADERLESS_CAP_MS);
    };

    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|raw| raw.trim().parse::<f64>().ok())
    {
        return ms.ceil().max(0.0) as u64;
    }

    if let Some(raw) = headers.get("retry-after") {
        if let Ok(seconds) = raw.trim().parse::<f64>() {
            return (seconds * 1000.0).ceil().max(0.0) as u64;
        }
        if let Some(ms) = parse_http_date_delay(raw, Utc::now()) {
            return ms;
        }
    }

    backoff_ms(attempt)
}

/// Deadline-bounded variant: `None` means give up.
///
/// Gives up when the budget is already spent, when even the unbounded
/// delay would overshoot it, or when clamping leaves nothing to wait for.
pub fn bounded_delay_ms(
    error: &ApiError,
    attempt: u32,
    start_time: Instant,
    max_duration: Duration,
) -> Option<u64> {
    let elapsed = start_time.elapsed();
    if elapsed >= max_duration {
        return None;
    }

    let delay = delay_ms(error, attempt);
    if u128::from(delay) > max_duration.as_millis() {
        return None;
    }

    let remaining = (max_duration - elapsed).as_millis() as u64;
    let capped = delay.min(remaining);
    if capped == 0 {
        return None;
    }
    Some(capped)
}

/// [`bounded_delay_ms`] with the default 10-minute budget.
pub fn bounded_delay_ms_default(error: &ApiError, attempt: u32, start_time: Instant) -> Option<u64> {
    bounded_delay_ms(
        error,
        attempt,
        start_time,
        Duration::from_millis(DEFAULT_MAX_DURATION_MS),
    )
}

/// Block for `ms` milliseconds, or until `cancel` fires, whichever is
/// first. Cancellation rejects with [`Error::Aborted`]; a dropped cancel
/// sender just sleeps out the remainder.
pub fn sleep(ms: u64, cancel: &Receiver<()>) -> Result<()> {
    let duration = Duration::from_millis(ms);
    let start = Instant::now();

    match cancel.recv_timeout(duration) {
        Ok(()) => Err(Error::Aborted),
        Err(RecvTimeoutError::Timeout) => Ok(()),
        Err(RecvTimeoutError::Disconnected) => {
            std::thread::sleep(duration.saturating_sub(start.elapsed()));
            Ok(())
        }
    }
}

fn backoff_ms(attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1);
    INITIAL_DELAY_MS.saturating_mul(u64::from(BACKOFF_FACTOR).saturating_pow(exponent))
}

/// `retry-after` as an HTTP-date: milliseconds until it, if in the future.
fn parse_http_date_delay(raw: &str, now: DateTime<Utc>) -> Option<u64> {
    let date = DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    let delta_ms = date.with_timezone(&Utc).timestamp_millis() - now.timestamp_millis();
    if delta_ms > 0 {
        Some(delta_ms as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn headerless() -> ApiError {
        ApiError::default()
    }

    fn empty_headers() -> ApiError {
        ApiError::with_headers(Vec::<(String, String)>::new())
    }

    #[test]
    fn test_retry_after_ms_verbatim() {
        let error = ApiError::with_headers([("retry-after-ms", "750")]);
        assert_eq!(delay_ms(&error, 1), 750);
    }

    #[test]
    fn test_retry_after_seconds_scaled() {
        let error = ApiError::with_headers([("retry-after", "2")]);
        assert_eq!(delay_ms(&error, 1), 2_000);
    }

    #[test]
    fn test_retry_after_ms_wins_over_retry_after() {
        let error = ApiError::with_headers([("retry-after-ms", "750"), ("retry-after", "60")]);
        assert_eq!(delay_ms(&error, 1), 750);
    }

    #[test]
    fn test_http_date_hint() {
        let now = Utc::now();
        let future = (now + chrono::Duration::seconds(90)).to_rfc2822();
        assert!(parse_http_date_delay(&future, now).is_some_and(|ms| ms >= 89_000));

        let past = (now - chrono::Duration::seconds(90)).to_rfc2822();
        assert_eq!(parse_http_date_delay(&past, now), None);
    }

    #[test]
    fn test_stale_date_falls_back_to_uncapped_backoff() {
        let past = (Utc::now() - chrono::Duration::hours(1)).to_rfc2822();
        let error = ApiError::with_headers([("retry-after", past)]);
        // attempt 6: 2000 * 2^5 = 64_000, above the headerless cap.
        assert_eq!(delay_ms(&error, 6), 64_000);
    }

    #[test]
    fn test_headerless_backoff_is_capped() {
        assert_eq!(delay_ms(&headerless(), 1), 2_000);
        assert_eq!(delay_ms(&headerless(), 4), 16_000);
        assert_eq!(delay_ms(&headerless(), 6), 30_000);
        assert_eq!(delay_ms(&headerless(), 20), 30_000);
    }

    #[test]
    fn test_useless_headers_backoff_is_uncapped() {
        assert_eq!(delay_ms(&empty_headers(), 6), 64_000);
    }

    #[test]
    fn test_headerless_delay_is_monotone_up_to_cap() {
        let mut previous = 0;
        for attempt in 1..=12 {
            let delay = delay_ms(&headerless(), attempt);
            assert!(delay >= previous, "attempt {} regressed", attempt);
            previous = delay;
        }
        assert_eq!(previous, HEADERLESS_CAP_MS);
    }

    #[test]
    fn test_backoff_never_overflows() {
        assert_eq!(delay_ms(&empty_headers(), u32::MAX), u64::MAX);
    }

    #[test]
    fn test_bounded_near_deadline_clamps() {
        // 599s elapsed of a 600s budget: whatever backoff says, at most
        // one second remains.
        let Some(start) = Instant::now().checked_sub(Duration::from_millis(599_000)) else {
            return; // monotonic clock too young to backdate
        };
        let delay = bounded_delay_ms_default(&headerless(), 10, start);
        assert!(delay.is_some_and(|ms| ms > 0 && ms <= 1_000), "{:?}", delay);
    }

    #[test]
    fn test_bounded_gives_up_after_deadline() {
        let Some(start) = Instant::now().checked_sub(Duration::from_millis(600_000)) else {
            return; // monotonic clock too young to backdate
        };
        assert_eq!(bounded_delay_ms_default(&headerless(), 1, start), None);
    }

    #[test]
    fn test_bounded_gives_up_when_delay_overshoots_budget() {
        let error = ApiError::with_headers([("retry-after-ms", "5000")]);
        let result = bounded_delay_ms(&error, 1, Instant::now(), Duration::from_millis(4_000));
        assert_eq!(result, None);
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let (_tx, rx) = channel();
        let start = Instant::now();
        sleep(20, &rx).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_aborts_on_cancel() {
        let (tx, rx) = channel();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            let _ = tx.send(());
        });

        let start = Instant::now();
        let err = sleep(10_000, &rx).unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_survives_dropped_cancel_sender() {
        let (tx, rx) = channel::<()>();
        drop(tx);
        let start = Instant::now();
        sleep(20, &rx).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
