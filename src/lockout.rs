//! Client-side login lockout.
//!
//! DESIGN
//! ======
//! A counter of consecutive failures, persisted with the rest of the session
//! state. Failures older than the lock window no longer count, so the limit
//! applies to failures "within the window". Reaching the limit sets
//! `locked_until`; the lock lifts purely on wall-clock elapse.
//!
//! TRADE-OFFS
//! ==========
//! Clearing local storage resets the counter. This is a UX guard against
//! accidental hammering, not a security control; real throttling belongs to
//! the server, whose 423/429 answers are surfaced separately.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::duration_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lock_duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Open,
    /// Locked until the given epoch milliseconds.
    Locked { until: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginAttempts {
    pub count: u32,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    #[serde(default)]
    pub locked_until: Option<i64>,
}

impl LoginAttempts {
    /// Current lock state. An elapsed lock is lifted and the counter reset.
    pub fn check_at(&mut self, now_ms: i64) -> LockState {
        match self.locked_until {
            Some(until) if now_ms < until => LockState::Locked { until },
            Some(_) => {
                self.reset();
                LockState::Open
            }
            None => LockState::Open,
        }
    }

    /// Record one failed login and return the resulting state.
    pub fn record_failure_at(&mut self, policy: LockoutPolicy, now_ms: i64) -> LockState {
        if let LockState::Locked { until } = self.check_at(now_ms) {
            return LockState::Locked { until };
        }

        let window = duration_ms(policy.lock_duration);
        if self
            .last_attempt_at
            .is_some_and(|last| now_ms.saturating_sub(last) > window)
        {
            self.count = 0;
        }

        self.count = self.count.saturating_add(1);
        self.last_attempt_at = Some(now_ms);

        if self.count >= policy.max_attempts {
            let until = now_ms.saturating_add(window);
            self.locked_until = Some(until);
            return LockState::Locked { until };
        }
        LockState::Open
    }

    /// Attempts left before the lock engages.
    #[must_use]
    pub fn remaining(&self, policy: LockoutPolicy) -> u32 {
        policy.max_attempts.saturating_sub(self.count)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
#[path = "lockout_test.rs"]
mod tests;
