use std::time::Duration;

/// How much one run takes on and how fast it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Wait between one successful send and the next attempt.
    pub interval: Duration,
    /// Upper bound on entries claimed per run.
    pub batch_size: usize,
}

impl PacingPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_BATCH_SIZE: usize = 20;

    #[must_use]
    pub const fn new(interval: Duration, batch_size: usize) -> Self {
        Self {
            interval,
            batch_size,
        }
    }

    /// The wait owed after a success at `index` in a batch of `len`.
    ///
    /// Nothing is owed after the last entry.
    #[must_use]
    pub const fn after_success(&self, index: usize, len: usize) -> Option<Duration> {
        if index + 1 < len && !self.interval.is_zero() {
            Some(self.interval)
        } else {
            None
        }
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_BATCH_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_wait_after_the_last_entry() {
        let pacing = PacingPolicy::default();
        assert_eq!(pacing.after_success(0, 3), Some(Duration::from_secs(1)));
        assert_eq!(pacing.after_success(1, 3), Some(Duration::from_secs(1)));
        assert_eq!(pacing.after_success(2, 3), None);

        let unpaced = PacingPolicy::new(Duration::ZERO, 10);
        assert_eq!(unpaced.after_success(0, 3), None);
    }
}
