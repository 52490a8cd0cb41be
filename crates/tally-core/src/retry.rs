//! # Retry Policy
//!
//! Bounded retry schedules shared by replication and compaction.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Retry Policy                                  │
//! │                                                                         │
//! │  Fixed(5s), max 4 attempts        Exponential(1s → 30s), unbounded      │
//! │  ─────────────────────────        ─────────────────────────────────     │
//! │  attempt 1 ✗ ── 5s ──►            fail ── 1s ── 2s ── 4s ── 8s ──►      │
//! │  attempt 2 ✗ ── 5s ──►            ... 16s ── 30s ── 30s ── 30s ...      │
//! │  attempt 3 ✗ ── 5s ──►                                                  │
//! │  attempt 4 ✗ ── give up           success → reset() → back to 1s        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the delay arithmetic lives here. Callers own the timers.

use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use backoff::ExponentialBackoff;

/// Shape of the delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffKind {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
        /// Randomization factor in `[0, 1)`; 0 disables jitter.
        jitter: f64,
    },
}

/// How many times to try, and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub kind: BackoffKind,
}

impl RetryPolicy {
    /// Fixed delay, bounded attempts.
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts.max(1)),
            kind: BackoffKind::Fixed(delay),
        }
    }

    /// Doubling delay capped at `max`, unbounded attempts, no jitter.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        RetryPolicy {
            max_attempts: None,
            kind: BackoffKind::Exponential {
                initial,
                max: max.max(initial),
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        if let BackoffKind::Exponential { jitter, .. } = &mut self.kind {
            *jitter = factor.clamp(0.0, 0.99);
        }
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }

    /// Starts a fresh schedule.
    pub fn schedule(&self) -> RetrySchedule {
        let inner: Box<dyn Backoff + Send> = match &self.kind {
            BackoffKind::Fixed(delay) => Box::new(Constant::new(*delay)),
            BackoffKind::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            } => Box::new(ExponentialBackoff {
                current_interval: *initial,
                initial_interval: *initial,
                max_interval: *max,
                multiplier: *multiplier,
                randomization_factor: *jitter,
                max_elapsed_time: None,
                ..Default::default()
            }),
        };

        RetrySchedule {
            max_attempts: self.max_attempts,
            failures: 0,
            inner,
        }
    }
}

/// A running schedule: one `next_delay` call per failed attempt.
pub struct RetrySchedule {
    max_attempts: Option<u32>,
    failures: u32,
    inner: Box<dyn Backoff + Send>,
}

impl RetrySchedule {
    /// Records a failure and returns the delay before the next attempt,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);

        if let Some(max) = self.max_attempts {
            if self.failures >= max {
                return None;
            }
        }

        self.inner.next_backoff()
    }

    /// Back to the initial delay after a success.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.inner.reset();
    }

    /// Failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl std::fmt::Debug for RetrySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySchedule")
            .field("max_attempts", &self.max_attempts)
            .field("failures", &self.failures)
            .finish()
    }
}
