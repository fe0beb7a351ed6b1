//! Shared scheduler status for the /health and /cycles endpoints.
//! Written by the scheduler, read by the API.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::scheduler::SchedulerState;
use crate::types::CycleResult;

#[derive(Default)]
pub struct HealthState {
    state: AtomicU8,
    /// Seconds until the next scheduled tick, as currently widened.
    interval_secs: AtomicU64,
    cycles_completed: AtomicU64,
    ticks_suppressed: AtomicU64,
    /// Unix seconds when the last cycle finished (0 = none yet).
    last_cycle_at: AtomicI64,
    last_result: Mutex<Option<CycleResult>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_interval_secs(&self, secs: u64) {
        self.interval_secs.store(secs, Ordering::Relaxed);
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }

    pub fn inc_ticks_suppressed(&self) {
        self.ticks_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks_suppressed(&self) -> u64 {
        self.ticks_suppressed.load(Ordering::Relaxed)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn last_cycle_at(&self) -> Option<i64> {
        match self.last_cycle_at.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn record_cycle(&self, result: &CycleResult, finished_at: i64) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_at.store(finished_at, Ordering::Relaxed);
        if let Ok(mut last) = self.last_result.lock() {
            *last = Some(result.clone());
        }
    }

    pub fn last_result(&self) -> Option<CycleResult> {
        self.last_result.lock().ok().and_then(|r| r.clone())
    }
}
