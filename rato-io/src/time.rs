//! Timers and backoff schedules
//!
//! Every retry loop in RatoNet (link reconnects, publisher restarts) draws its
//! delays from a [`Backoff`]. Periodic work (probe cycles, health samples,
//! orphan sweeps) runs off a [`Timer`].

use std::time::{Duration, Instant};

/// Timer for periodic operations
///
/// Takes explicit instants so callers driving a state machine from a loop
/// can share one `now` per iteration.
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a timer that first expires one interval after `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now,
        }
    }

    /// Create a timer that is already expired
    pub fn expired_at(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now.checked_sub(interval).unwrap_or(now),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check if the timer has expired
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fire) >= self.interval
    }

    /// Reset the timer
    pub fn reset(&mut self, now: Instant) {
        self.last_fire = now;
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self, now: Instant) -> Duration {
        self.interval
            .saturating_sub(now.saturating_duration_since(self.last_fire))
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.expired(now) {
            self.reset(now);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
enum Schedule {
    /// Explicit steps; the last one repeats
    Steps(Vec<Duration>),
    /// Doubling from `initial`, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

/// Retry delay schedule with an optional attempt cap
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: Schedule,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    /// Fixed steps, repeating the last one once they run out
    ///
    /// An empty list yields zero delays.
    pub fn fixed_steps(steps: Vec<Duration>) -> Self {
        Backoff {
            schedule: Schedule::Steps(steps),
            max_attempts: None,
            attempts: 0,
        }
    }

    /// Doubling delays starting at `initial`, never above `max`
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff {
            schedule: Schedule::Exponential { initial, max },
            max_attempts: None,
            attempts: 0,
        }
    }

    /// Stop yielding delays after `max_attempts`
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before the next attempt, or `None` once the cap is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    /// Delay the given zero-based attempt would get
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.schedule {
            Schedule::Steps(steps) => match steps.last() {
                Some(last) => steps.get(attempt as usize).copied().unwrap_or(*last),
                None => Duration::ZERO,
            },
            Schedule::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(*max)
            }
        }
    }

    /// Attempts handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_attempts.is_some_and(|max| self.attempts >= max)
    }

    /// Start the schedule over
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
