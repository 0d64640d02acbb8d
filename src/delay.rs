// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnection Delay Strategies
//!
//! A [`DelayProvider`] maps the current retry counter to the time a supervisor
//! waits before the next connection attempt. The counter starts at zero and is
//! reset after every successful reconnection.

use std::time::Duration;

/// Default wait between two reconnection attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(7500);

/// Computes how long to wait before the next reconnection attempt.
#[cfg_attr(test, mockall::automock)]
pub trait DelayProvider: Send + Sync {
    /// Returns the wait duration for the given retry counter.
    fn delay(&self, retry: u32) -> Duration;
}

impl<F> DelayProvider for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, retry: u32) -> Duration {
        self(retry)
    }
}

/// Waits the same amount of time between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        FixedDelay(DEFAULT_DELAY)
    }
}

impl DelayProvider for FixedDelay {
    fn delay(&self, _retry: u32) -> Duration {
        self.0
    }
}

/// Exponential backoff: `first × factor^retry`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffDelay {
    /// Delay for retry zero.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for BackoffDelay {
    fn default() -> Self {
        BackoffDelay {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl DelayProvider for BackoffDelay {
    fn delay(&self, retry: u32) -> Duration {
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
