// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Reverse Tunnel Contributors

// SSH Reverse Tunnel - Reconnect Scheduler
// Exponential backoff between reconnect attempts

use std::future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Deadline used when the computed backoff does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Backoff limits and the attempt counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    current_attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay_secs: u64) -> Self {
        Self {
            max_attempts,
            base_delay_secs,
            current_attempt: 0,
        }
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Delay before attempt `attempt` (1-indexed): `base * 2^(attempt - 1)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
        Duration::from_secs(self.base_delay_secs.saturating_mul(factor))
    }
}

/// Outcome of asking for another reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Attempt `attempt` will fire after `delay`
    Scheduled { attempt: u32, delay: Duration },
    /// The attempt ceiling has been reached; nothing was armed
    Exhausted { max_attempts: u32 },
}

/// Owns the backoff policy and the one-shot reconnect deadline
///
/// The deadline lives inside the controller's event loop, so cancelling is a
/// plain field write: once `cancel()` returns, `fired()` cannot complete for the
/// cancelled deadline.
#[derive(Debug)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    deadline: Option<Instant>,
}

impl ReconnectScheduler {
    pub fn new(max_attempts: u32, base_delay_secs: u64) -> Self {
        Self {
            policy: ReconnectPolicy::new(max_attempts, base_delay_secs),
            deadline: None,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Replace the limits; the attempt counter is kept but never exceeds the new ceiling
    pub fn set_limits(&mut self, max_attempts: u32, base_delay_secs: u64) {
        self.policy.max_attempts = max_attempts;
        self.policy.base_delay_secs = base_delay_secs;
        self.policy.current_attempt = self.policy.current_attempt.min(max_attempts);
    }

    /// Count another attempt and arm the timer, unless the ceiling is reached
    pub fn schedule(&mut self) -> ReconnectDecision {
        if self.policy.current_attempt >= self.policy.max_attempts {
            self.deadline = None;
            return ReconnectDecision::Exhausted {
                max_attempts: self.policy.max_attempts,
            };
        }

        self.policy.current_attempt += 1;
        let attempt = self.policy.current_attempt;
        let delay = self.policy.delay_for_attempt(attempt);
        let now = Instant::now();
        self.deadline = Some(now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE));

        ReconnectDecision::Scheduled { attempt, delay }
    }

    /// Disarm the pending timer. Returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Clear the attempt counter (after a successful connection or a manual start)
    pub fn reset(&mut self) {
        self.policy.current_attempt = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the armed deadline passes, disarming it. Pending while unarmed.
    pub async fn fired(&mut self) -> u32 {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
                self.policy.current_attempt
            }
            None => future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = ReconnectPolicy::new(5, 5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(80));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = ReconnectPolicy::new(200, 60);
        assert_eq!(policy.delay_for_attempt(100), Duration::from_secs(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_until_exhausted() {
        let mut scheduler = ReconnectScheduler::new(3, 2);

        let mut delays = Vec::new();
        while let ReconnectDecision::Scheduled { attempt, delay } = scheduler.schedule() {
            assert_eq!(attempt, scheduler.policy().current_attempt());
            delays.push(delay.as_secs());
        }
        assert_eq!(delays, vec![2, 4, 8]);
        assert!(scheduler.policy().current_attempt() <= scheduler.policy().max_attempts);

        // Stays exhausted and never arms
        assert_eq!(
            scheduler.schedule(),
            ReconnectDecision::Exhausted { max_attempts: 3 }
        );
        assert!(!scheduler.is_armed());

        scheduler.reset();
        assert_eq!(
            scheduler.schedule(),
            ReconnectDecision::Scheduled {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_after_delay() {
        let mut scheduler = ReconnectScheduler::new(5, 5);
        scheduler.schedule();

        let started = Instant::now();
        let attempt = scheduler.fired().await;

        assert_eq!(attempt, 1);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_millis(5_100));
        assert!(!scheduler.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut scheduler = ReconnectScheduler::new(5, 1);
        scheduler.schedule();
        assert!(scheduler.cancel());
        assert!(!scheduler.cancel());

        let result = tokio::time::timeout(Duration::from_secs(3600), scheduler.fired()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_set_limits_keeps_counter() {
        let mut scheduler = ReconnectScheduler::new(5, 5);
        scheduler.schedule();
        scheduler.cancel();
        scheduler.set_limits(3, 30);

        assert_eq!(scheduler.policy().current_attempt(), 1);
        assert!(matches!(
            scheduler.schedule(),
            ReconnectDecision::Scheduled { attempt: 2, .. }
        ));
    }

    #[test]
    fn test_lowering_limit_clamps_counter() {
        let mut scheduler = ReconnectScheduler::new(5, 5);
        for _ in 0..3 {
            scheduler.schedule();
        }
        scheduler.cancel();
        scheduler.set_limits(1, 5);

        let policy = scheduler.policy();
        assert!(policy.current_attempt() <= policy.max_attempts);
        assert_eq!(policy.current_attempt(), 1);
        assert_eq!(
            scheduler.schedule(),
            ReconnectDecision::Exhausted { max_attempts: 1 }
        );
    }
}
