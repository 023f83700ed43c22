//! Retry policy with bounded exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::TransferFailure;
use crate::error::UploadError;

/// Verdict of the retry policy for a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Schedule retry number `retry` (1-based) after `delay`.
    Retry { retry: u32, delay: Duration },
    /// Stop and report `error` to the observer.
    GiveUp(UploadError),
}

/// Configuration for retrying failed uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retries per item; total attempts are `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied for each subsequent retry.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Adds ±10% jitter to each delay (still capped at `max_delay_ms`).
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Decides what to do after a failed attempt.
    ///
    /// `retries_so_far` is the number of retries already scheduled for the
    /// item (0 after the first physical attempt fails).
    pub fn decide(&self, failure: &TransferFailure, retries_so_far: u32) -> RetryDecision {
        let error = failure.classify();
        if !error.is_retryable() {
            return RetryDecision::GiveUp(error);
        }
        if retries_so_far >= self.max_retries {
            return RetryDecision::GiveUp(UploadError::RetriesExhausted {
                attempts: retries_so_far.saturating_add(1),
                last: Box::new(error),
            });
        }
        RetryDecision::Retry {
            retry: retries_so_far + 1,
            delay: self.delay_for_retry(retries_so_far),
        }
    }

    /// Backoff before retry `k` (0-based): `base * factor^k`, capped.
    pub fn delay_for_retry(&self, k: u32) -> Duration {
        let exp = k.min(63) as i32;
        let base = Duration::from_millis(self.base_delay_ms).as_secs_f64();
        let cap = Duration::from_millis(self.max_delay_ms).as_secs_f64();
        let capped = (base * self.backoff_factor.powi(exp)).min(cap);

        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }

        Duration::from_secs_f64(apply_jitter(capped, cap, jitter_offset()))
    }
}

/// Pseudo-random offset in `[-1.0, 1.0)` from the clock's sub-second nanos.
fn jitter_offset() -> f64 {
    offset_from_nanos(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    )
}

/// Maps `nanos` in `[0, 1e9)` onto `[-1.0, 1.0)`.
fn offset_from_nanos(nanos: u32) -> f64 {
    (nanos as f64 / 1_000_000_000.0) * 2.0 - 1.0
}

/// Scales `secs` by `1 + 0.1 * offset`, never exceeding `cap`.
fn apply_jitter(secs: f64, cap: f64, offset: f64) -> f64 {
    (secs + secs * 0.1 * offset).clamp(0.0, cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert!((policy.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert!(!policy.jitter);
    }

    #[test]
    fn delays_double_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 3000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(3));
        assert_eq!(policy.delay_for_retry(200), Duration::from_secs(3));
    }

    #[test]
    fn jitter_covers_both_sides() {
        assert!((apply_jitter(2.0, 60.0, -1.0) - 1.8).abs() < 1e-9);
        assert!((apply_jitter(2.0, 60.0, 0.0) - 2.0).abs() < 1e-9);
        assert!((apply_jitter(2.0, 60.0, 0.999) - 2.1998).abs() < 1e-9);
        // Jitter never pushes a delay past the cap.
        assert_eq!(apply_jitter(60.0, 60.0, 0.5), 60.0);
    }

    #[test]
    fn jitter_offset_spans_full_range() {
        assert_eq!(offset_from_nanos(0), -1.0);
        assert_eq!(offset_from_nanos(500_000_000), 0.0);
        assert!(offset_from_nanos(999_999_999) > 0.999);

        // Delays above nominal are reachable.
        let policy = RetryPolicy::default();
        let base = policy.delay_for_retry(0).as_secs_f64();
        let upper = apply_jitter(base, 60.0, offset_from_nanos(999_999_999));
        assert!(upper > 1.099, "upper bound {upper}");

        for _ in 0..100 {
            let offset = jitter_offset();
            assert!((-1.0..1.0).contains(&offset), "offset {offset}");
        }
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for k in 0..3 {
            let base = 2f64.powi(k as i32);
            let secs = policy.delay_for_retry(k).as_secs_f64();
            assert!(
                secs >= base * 0.89 && secs <= base * 1.11,
                "retry {k}: {secs:.3}s"
            );
        }
    }

    #[test]
    fn retryable_failures_retry_three_times() {
        let policy = RetryPolicy::default();
        let failure = TransferFailure::Status(503);

        for (done, expected_delay) in [(0, 1), (1, 2), (2, 4)] {
            assert_eq!(
                policy.decide(&failure, done),
                RetryDecision::Retry {
                    retry: done + 1,
                    delay: Duration::from_secs(expected_delay),
                }
            );
        }

        assert_eq!(
            policy.decide(&failure, 3),
            RetryDecision::GiveUp(UploadError::RetriesExhausted {
                attempts: 4,
                last: Box::new(UploadError::ServerTransient(503)),
            })
        );
    }

    #[test]
    fn transport_failures_are_retried() {
        let policy = RetryPolicy::default();
        for kind in [
            TransportErrorKind::Timeout,
            TransportErrorKind::Dns,
            TransportErrorKind::ConnectionReset,
            TransportErrorKind::NotConnected,
        ] {
            let decision = policy.decide(&TransferFailure::transport(kind, "boom"), 0);
            assert!(matches!(decision, RetryDecision::Retry { retry: 1, .. }));
        }
    }

    #[test]
    fn terminal_failures_give_up_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&TransferFailure::Status(404), 0),
            RetryDecision::GiveUp(UploadError::ServerRejected(404))
        );
        assert_eq!(
            policy.decide(&TransferFailure::Local("malformed".into()), 0),
            RetryDecision::GiveUp(UploadError::RequestFailed("malformed".into()))
        );
    }

    #[test]
    fn zero_retries_gives_up_on_first_failure() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.decide(&TransferFailure::Status(500), 0),
            RetryDecision::GiveUp(UploadError::RetriesExhausted { attempts: 1, .. })
        ));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let policy: RetryPolicy = toml::from_str("max_retries = 5").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay_ms, 60_000);
    }
}
