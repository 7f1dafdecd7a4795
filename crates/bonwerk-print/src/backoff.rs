// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Exponential backoff for periodic loops.
//
// interval = min(base * 2^failures, max). A success snaps back to base.

use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Current wait before the next attempt.
    pub fn current(&self) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(self.failures))
            .min(self.max)
    }

    /// Record a failed round and return the new interval.
    pub fn on_failure(&mut self) -> Duration {
        if self.current() < self.max {
            self.failures = self.failures.saturating_add(1);
        }
        let next = self.current();
        debug!(
            failures = self.failures,
            interval_ms = u64::try_from(next.as_millis()).unwrap_or(u64::MAX),
            "backing off"
        );
        next
    }

    /// Record a successful round; the interval returns to base.
    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
