//! Shared countdown derived from the session row.
//!
//! Every client computes remaining time from the same `TimerState`, so a late
//! joiner converges on the same display without any tick-by-tick writes.
//! Operator actions never mutate local state directly; they return the state
//! to write back and the new value comes home through the change feed.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use chrono::Utc;
use shared::domain::TimerState;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Wall clock in unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now_ms.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Paused,
    Expired,
}

/// Whole seconds elapsed since the timer started. A start in the future
/// (clock skew) counts as zero.
pub fn elapsed_seconds(state: &TimerState, now_ms: i64) -> u32 {
    match (state.is_running, state.start_timestamp) {
        (true, Some(start)) if now_ms > start => {
            u32::try_from((now_ms - start) / 1000).unwrap_or(u32::MAX)
        }
        _ => 0,
    }
}

pub fn remaining_seconds(state: &TimerState, now_ms: i64) -> u32 {
    state
        .total_seconds()
        .saturating_sub(elapsed_seconds(state, now_ms))
}

pub fn phase(state: &TimerState, now_ms: i64) -> TimerPhase {
    if state.is_running {
        if remaining_seconds(state, now_ms) == 0 {
            TimerPhase::Expired
        } else {
            TimerPhase::Running
        }
    } else if state.total_seconds() > 0 {
        TimerPhase::Paused
    } else {
        TimerPhase::Idle
    }
}

pub fn format_mm_ss(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub remaining_seconds: u32,
    pub phase: TimerPhase,
    /// Set on exactly one tick per arm cycle.
    pub expired: bool,
}

/// Local view of the authoritative timer plus the expiry edge guard.
#[derive(Debug, Clone, Default)]
pub struct TimerClock {
    state: TimerState,
    expiry_reported: bool,
}

impl TimerClock {
    pub fn new(state: TimerState) -> Self {
        Self {
            state,
            expiry_reported: false,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn remaining(&self, now_ms: i64) -> u32 {
        remaining_seconds(&self.state, now_ms)
    }

    pub fn phase(&self, now_ms: i64) -> TimerPhase {
        phase(&self.state, now_ms)
    }

    /// Replaces local state with the authoritative value. Any actual change
    /// re-arms the expiry edge; a redelivered identical state does not.
    pub fn apply_remote(&mut self, state: TimerState) {
        if state != self.state {
            self.state = state;
            self.expiry_reported = false;
        }
    }

    pub fn tick(&mut self, now_ms: i64) -> TimerTick {
        let remaining_seconds = self.remaining(now_ms);
        let phase = self.phase(now_ms);
        let expired = phase == TimerPhase::Expired && !self.expiry_reported;
        if expired {
            self.expiry_reported = true;
        }
        TimerTick {
            remaining_seconds,
            phase,
            expired,
        }
    }

    pub fn start(&self, minutes: u32, now_ms: i64) -> TimerState {
        TimerState::from_total_seconds(minutes.saturating_mul(60), true, Some(now_ms))
    }

    /// Freezes the current remaining time as the new budget.
    pub fn pause(&self, now_ms: i64) -> TimerState {
        TimerState::from_total_seconds(self.remaining(now_ms), false, None)
    }

    /// `None` when there is nothing paused to resume.
    pub fn resume(&self, now_ms: i64) -> Option<TimerState> {
        if self.state.is_running || self.state.total_seconds() == 0 {
            return None;
        }
        Some(TimerState::from_total_seconds(
            self.state.total_seconds(),
            true,
            Some(now_ms),
        ))
    }

    pub fn reset(&self) -> TimerState {
        TimerState::idle()
    }

    /// Moves the deadline by `delta_minutes`. A running timer keeps its start
    /// instant so elapsed time is preserved; the budget never drops below what
    /// has already elapsed.
    pub fn adjust(&self, delta_minutes: i32, now_ms: i64) -> TimerState {
        let delta = i64::from(delta_minutes) * 60;
        let total = i64::from(self.state.total_seconds()) + delta;
        if self.state.is_running {
            let floor = i64::from(elapsed_seconds(&self.state, now_ms));
            let total = u32::try_from(total.max(floor)).unwrap_or(u32::MAX);
            TimerState::from_total_seconds(total, true, self.state.start_timestamp)
        } else {
            let total = u32::try_from(total.max(0)).unwrap_or(u32::MAX);
            TimerState::from_total_seconds(total, false, None)
        }
    }

    /// What the first client to observe expiry writes back.
    pub fn expired_state() -> TimerState {
        TimerState::idle()
    }
}

#[cfg(test)]
#[path = "tests/timer_tests.rs"]
mod tests;
