//! When should a resource be reconciled again.

use std::time::Duration;

/// What the last reconciliation ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// NotFound or Unauthorized: re-checked at the normal cadence.
    PermanentFailure,
    TransientFailure,
    /// Nothing to do until the spec changes.
    AwaitingSpecChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    AwaitChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    pub backoff_base: Duration,
}

impl RequeuePolicy {
    pub fn new(backoff_base: Duration) -> Self {
        Self { backoff_base }
    }

    /// `consecutive_failures` counts the transient failures in a row,
    /// including the one that just happened.
    pub fn next_requeue(
        &self,
        outcome: Outcome,
        consecutive_failures: u32,
        interval: Duration,
    ) -> Requeue {
        match outcome {
            Outcome::Succeeded | Outcome::PermanentFailure => Requeue::After(interval),
            Outcome::TransientFailure => Requeue::After(self.backoff(consecutive_failures, interval)),
            Outcome::AwaitingSpecChange => Requeue::AwaitChange,
        }
    }

    /// base * 2^(n-1), at least `base`, at most `interval`.
    pub fn backoff(&self, consecutive_failures: u32, interval: Duration) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1);
        let factor = 2u32.saturating_pow(exponent);
        self.backoff_base
            .saturating_mul(factor)
            .max(self.backoff_base)
            .min(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RequeuePolicy {
        RequeuePolicy::new(Duration::from_secs(5))
    }

    #[test]
    fn test_success_and_permanent_use_interval() {
        let interval = Duration::from_secs(600);
        assert_eq!(
            policy().next_requeue(Outcome::Succeeded, 0, interval),
            Requeue::After(interval)
        );
        assert_eq!(
            policy().next_requeue(Outcome::PermanentFailure, 0, interval),
            Requeue::After(interval)
        );
    }

    #[test]
    fn test_spec_change_outcome_never_requeues() {
        assert_eq!(
            policy().next_requeue(Outcome::AwaitingSpecChange, 3, Duration::from_secs(60)),
            Requeue::AwaitChange
        );
    }

    #[test]
    fn test_transient_backoff_doubles() {
        let interval = Duration::from_secs(600);
        let delays: Vec<Duration> = (1..=4).map(|n| policy().backoff(n, interval)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40)
            ]
        );
    }

    #[test]
    fn test_transient_backoff_is_capped_at_interval() {
        let interval = Duration::from_secs(60);
        assert_eq!(policy().backoff(5, interval), Duration::from_secs(60));
        assert_eq!(policy().backoff(u32::MAX, interval), interval);
    }

    #[test]
    fn test_transient_backoff_is_floored_at_base() {
        assert_eq!(policy().backoff(0, Duration::from_secs(60)), Duration::from_secs(5));
    }
}
