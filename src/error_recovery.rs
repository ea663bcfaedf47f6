//! Retry policy for malformed instrument responses.
//
// Transport failures (timeouts, dropped links) are never retried here; only
// responses that arrived but could not be interpreted are.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{InstrumentError, InstrumentResult};

/// Defines how often a malformed response is retried before giving up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub retries: u32,
    /// Pause before each retry, after stale input has been discarded.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Total number of attempts, including the first.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Runs `attempt` until it yields a value or the policy is exhausted.
    ///
    /// `attempt` receives the zero-based attempt index and returns
    /// `Ok(Ok(value))` on success, `Ok(Err(reason))` for a malformed response,
    /// and `Err(_)` for transport failures, which abort immediately. Attempts
    /// with a non-zero index are retries; the caller discards stale input
    /// before re-issuing the command.
    pub fn run<T>(
        &self,
        command: &str,
        mut attempt: impl FnMut(u32) -> InstrumentResult<Result<T, String>>,
    ) -> InstrumentResult<T> {
        let mut reason = String::new();
        for index in 0..self.attempts() {
            if index > 0 {
                warn!(command, attempt = index + 1, %reason, "Retrying malformed response");
                if !self.backoff.is_zero() {
                    std::thread::sleep(self.backoff);
                }
            }
            match attempt(index)? {
                Ok(value) => return Ok(value),
                Err(why) => reason = why,
            }
        }
        Err(InstrumentError::Communication {
            command: command.to_string(),
            attempts: self.attempts(),
            reason,
        })
    }
}
