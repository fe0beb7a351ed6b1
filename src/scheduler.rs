use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::Config;
use crate::cycle::CycleExecutor;
use crate::error::{AppError, Result};
use crate::types::{CycleOutcome, CycleResult, Trigger};

const CONTROL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
    Backoff = 2,
}

impl SchedulerState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SchedulerState::Running,
            2 => SchedulerState::Backoff,
            _ => SchedulerState::Idle,
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Backoff => write!(f, "backoff"),
        }
    }
}

/// Idle -> Running -> Idle | Backoff, with no timers or I/O.
///
/// A trigger while Running is refused, never queued. An auth failure doubles
/// the interval up to `max_interval`; one fully successful cycle restores it.
#[derive(Debug)]
pub struct SchedulerCore {
    state: SchedulerState,
    base_interval: Duration,
    max_interval: Duration,
    interval: Duration,
}

impl SchedulerCore {
    pub fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            state: SchedulerState::Idle,
            base_interval,
            max_interval: max_interval.max(base_interval),
            interval: base_interval,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true when a cycle may start now.
    pub fn on_trigger(&mut self) -> bool {
        if self.state == SchedulerState::Running {
            return false;
        }
        self.state = SchedulerState::Running;
        true
    }

    /// Settle the state after a cycle and return the interval to the next tick.
    pub fn on_complete(&mut self, result: &CycleResult) -> Duration {
        let outcome = result.outcome();
        if result.auth_failed && !result.cancelled && outcome == CycleOutcome::Failure {
            self.interval = self.interval.saturating_mul(2).min(self.max_interval);
            self.state = SchedulerState::Backoff;
            warn!(
                next_in_secs = self.interval.as_secs(),
                "Authentication failed, widening poll interval",
            );
        } else if outcome == CycleOutcome::Success {
            if self.interval != self.base_interval {
                info!(interval_secs = self.base_interval.as_secs(), "Cycle succeeded, poll interval restored");
            }
            self.interval = self.base_interval;
            self.state = SchedulerState::Idle;
        } else if self.interval > self.base_interval {
            self.state = SchedulerState::Backoff;
        } else {
            self.state = SchedulerState::Idle;
        }
        self.interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReply {
    Started,
    Busy,
}

pub struct ControlMsg {
    pub trigger: Trigger,
    pub reply: oneshot::Sender<TriggerReply>,
}

/// Cloneable way in for manual and backfill triggers.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<ControlMsg>,
}

impl SchedulerHandle {
    pub async fn trigger(&self, trigger: Trigger) -> Result<TriggerReply> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlMsg { trigger, reply })
            .await
            .map_err(|_| AppError::Cancelled)?;
        rx.await.map_err(|_| AppError::Cancelled)
    }
}

/// Drives cycles from a timer and from the control channel. Cycles run on
/// their own task so the loop keeps answering triggers while one is running.
pub struct Scheduler {
    core: SchedulerCore,
    executor: Arc<dyn CycleExecutor>,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
    control_rx: mpsc::Receiver<ControlMsg>,
    cancel: CancellationToken,
    run_on_startup: bool,
}

impl Scheduler {
    pub fn new(
        cfg: &Config,
        executor: Arc<dyn CycleExecutor>,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
        cancel: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let (tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let core = SchedulerCore::new(
            Duration::from_secs(cfg.poll_interval_secs),
            Duration::from_secs(cfg.max_backoff_secs),
        );
        health.set_interval_secs(core.interval().as_secs());
        let scheduler = Self {
            core,
            executor,
            health,
            latency,
            control_rx,
            cancel,
            run_on_startup: cfg.run_on_startup,
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::channel::<(CycleResult, Duration)>(1);
        let first = if self.run_on_startup { Duration::ZERO } else { self.core.interval() };
        let mut next_tick = Instant::now() + first;
        info!(
            interval_secs = self.core.interval().as_secs(),
            run_on_startup = self.run_on_startup,
            "Scheduler started",
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_tick) => {
                    next_tick = Instant::now() + self.core.interval();
                    if !self.start(Trigger::Timer, &done_tx) {
                        self.health.inc_ticks_suppressed();
                        info!("Previous cycle still running, skipping tick");
                    }
                }
                Some(msg) = self.control_rx.recv() => {
                    let reply = if self.start(msg.trigger, &done_tx) {
                        TriggerReply::Started
                    } else {
                        info!(trigger = %msg.trigger, "Cycle already running, trigger refused");
                        TriggerReply::Busy
                    };
                    let _ = msg.reply.send(reply);
                }
                Some((result, took)) = done_rx.recv() => {
                    self.finish(&result, took, &mut next_tick);
                }
            }
        }

        if self.core.state() == SchedulerState::Running {
            info!("Waiting for in-flight cycle to stop");
            if let Some((result, took)) = done_rx.recv().await {
                self.finish(&result, took, &mut next_tick);
            }
        }
        info!("Scheduler stopped");
    }

    fn start(&mut self, trigger: Trigger, done_tx: &mpsc::Sender<(CycleResult, Duration)>) -> bool {
        if !self.core.on_trigger() {
            return false;
        }
        self.health.set_state(SchedulerState::Running);

        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.child_token();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = executor.execute(trigger, cancel).await;
            let _ = done_tx.send((result, started.elapsed())).await;
        });
        true
    }

    fn finish(&mut self, result: &CycleResult, took: Duration, next_tick: &mut Instant) {
        let previous = self.core.interval();
        let interval = self.core.on_complete(result);
        if interval != previous {
            *next_tick = Instant::now() + interval;
        }

        self.latency.record_cycle(took);
        self.health.set_state(self.core.state());
        self.health.set_interval_secs(interval.as_secs());
        self.health.record_cycle(result, Utc::now().timestamp());
    }
}
