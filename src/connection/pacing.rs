//! Minimum spacing between successive writes.
//!
//! Some instruments drop a command that arrives too soon after the previous
//! one. The pacer delays only the next write; reading the response to the
//! write in flight is never held back.

use std::time::{Duration, Instant};
use tracing::trace;

/// Tracks when the next write may go out.
#[derive(Debug, Clone)]
pub struct WritePacer {
    interval: Duration,
    next_allowed: Option<Instant>,
}

impl WritePacer {
    /// Pacer enforcing `interval`; zero disables it.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: None,
        }
    }

    /// Configured spacing.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the spacing; takes effect from the next write.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
        if interval.is_zero() {
            self.next_allowed = None;
        }
    }

    /// Block until the next write is permitted.
    pub fn acquire(&self) {
        if let Some(at) = self.next_allowed {
            let wait = at.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                trace!(?wait, "Pacing write");
                std::thread::sleep(wait);
            }
        }
    }

    /// Record that a write just went out.
    pub fn release(&mut self) {
        if !self.interval.is_zero() {
            self.next_allowed = Some(Instant::now() + self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_never_waits() {
        let mut pacer = WritePacer::new(Duration::ZERO);
        pacer.release();
        let started = Instant::now();
        pacer.acquire();
        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_spacing_enforced() {
        let mut pacer = WritePacer::new(Duration::from_millis(40));
        pacer.acquire();
        let first = Instant::now();
        pacer.release();
        pacer.acquire();
        assert!(first.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_elapsed_interval_does_not_wait() {
        let mut pacer = WritePacer::new(Duration::from_millis(10));
        pacer.release();
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        pacer.acquire();
        assert!(started.elapsed() < Duration::from_millis(10));
    }
}
