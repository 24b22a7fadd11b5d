//! Retry policy: attempt budget and backoff schedule.

use chrono::Duration;

/// Default attempt budget per delivery
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff schedule in minutes. Attempt `n` (1-based) that fails waits
/// `BACKOFF[n-1]`; indices past the end clamp to the last entry.
pub const DEFAULT_BACKOFF_MINUTES: [i64; 5] = [1, 5, 15, 60, 240];

/// Longest single backoff delay accepted: one week
pub const MAX_BACKOFF_MINUTES: i64 = 7 * 24 * 60;

/// Attempt budget and delay schedule, fixed per process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per delivery, stamped on each delivery at creation
    pub max_attempts: u32,
    /// Delay after the n-th failed attempt (never empty)
    pub backoff: Vec<Duration>,
}

impl RetryPolicy {
    /// Build a policy; `backoff_minutes` must be non-empty and `max_attempts` ≥ 1
    pub fn new(max_attempts: u32, backoff_minutes: &[i64]) -> crate::Result<Self> {
        if max_attempts == 0 {
            return Err(crate::Error::Config(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if backoff_minutes.is_empty() {
            return Err(crate::Error::Config(
                "backoff schedule cannot be empty".to_string(),
            ));
        }
        let backoff = backoff_minutes
            .iter()
            .map(|m| match *m {
                m if m < 0 => Err(crate::Error::Config(
                    "backoff delays cannot be negative".to_string(),
                )),
                m if m > MAX_BACKOFF_MINUTES => Err(crate::Error::Config(format!(
                    "backoff delay of {m} minutes exceeds {MAX_BACKOFF_MINUTES}"
                ))),
                m => Duration::try_minutes(m).ok_or_else(|| {
                    crate::Error::Config(format!("backoff delay of {m} minutes is out of range"))
                }),
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self {
            max_attempts,
            backoff,
        })
    }

    /// Same schedule with a different attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay to wait after `attempts` failed attempts (1-based, clamped)
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let idx = (attempts.max(1) as usize - 1).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF_MINUTES
                .iter()
                .map(|m| Duration::minutes(*m))
                .collect(),
        }
    }
}
