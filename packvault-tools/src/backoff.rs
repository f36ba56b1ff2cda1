//! Bounded exponential backoff with jitter for retriable operations.

use std::time::Duration;

/// Retry schedule: exponential growth from `base` up to `cap`, with up to
/// 50% random jitter added to every delay.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: usize) -> Self {
        Self {
            base,
            cap,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Immediate failure, no retries. Used by tests and by operations that
    /// do their own scheduling.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            max_attempts: 1,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let raw = self
            .base
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        let capped = raw.min(self.cap);
        capped + jitter(capped)
    }
}

fn jitter(delay: Duration) -> Duration {
    let mut byte = [0u8; 1];
    if openssl::rand::rand_bytes(&mut byte).is_err() {
        return Duration::ZERO;
    }
    // up to 50% extra
    delay.mul_f64(byte[0] as f64 / 512.0)
}

/// Run `op` until it succeeds, the error is not retriable, or the attempt
/// budget is exhausted. The last error is returned unchanged, so callers keep
/// their own error classification.
pub fn retry<T, E, F, R>(desc: &str, backoff: &Backoff, retriable: R, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= backoff.max_attempts || !retriable(&err) {
                    return Err(err);
                }
                let delay = backoff.delay(attempt);
                log::warn!(
                    "{}: attempt {}/{} failed ({}), retrying in {:?}",
                    desc,
                    attempt,
                    backoff.max_attempts,
                    err,
                    delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 3);
        let result: Result<(), String> = retry("test", &backoff, |_| true, || {
            calls += 1;
            Err("boom".to_string())
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn stops_on_permanent_error() {
        let mut calls = 0;
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 5);
        let result: Result<(), String> = retry("test", &backoff, |_| false, || {
            calls += 1;
            Err("denied".to_string())
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn succeeds_mid_schedule() {
        let mut calls = 0;
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 5);
        let result: Result<u32, String> = retry("test", &backoff, |_| true, || {
            calls += 1;
            if calls < 3 {
                Err("flaky".to_string())
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 3);
    }

    #[test]
    fn delays_are_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 30);
        for attempt in 1..30 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(1500));
        }
    }
}
