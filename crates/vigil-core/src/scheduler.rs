//! Cron sweep + one-shot timers on the shared tokio runtime.
//!
//! The scheduler only enqueues work: the recurring sweep runs in one background task,
//! and every `schedule_once` call gets its own task. Armed timers are never cancelled
//! individually; callbacks are expected to check staleness themselves. `stop()` halts
//! the sweep, refuses new timers, and drops timers that have not fired yet.

use crate::error::{Result, VigilError};
use chrono::Utc;
use cron::Schedule;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A unit of scheduled work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Anything that can run a job once after a delay.
pub trait TimerQueue: Send + Sync {
    /// Arms a one-shot timer. Returns `false` when the job was refused (e.g. after stop).
    fn schedule_once(&self, delay: Duration, job: Job) -> bool;
}

/// Parses a sweep schedule. Classic five-field cron (`min hour dom mon dow`) is accepted
/// and pinned to second zero; six/seven-field expressions pass through unchanged.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| VigilError::InvalidSchedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// The process-wide scheduler.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            stopped: AtomicBool::new(false),
            sweep_task: Mutex::new(None),
        }
    }

    /// Registers the recurring sweep. Fails on an invalid expression or after `stop()`.
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, expr: &str, sweep: F) -> Result<()>
    where
        F: Fn() -> Job + Send + Sync + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() || self.is_stopped() {
            return Err(VigilError::ShutDown);
        }
        let schedule = parse_schedule(expr)?;
        let expr_label = expr.to_string();

        info!(target: "vigil::scheduler", schedule = %expr_label, "sweep schedule registered");

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(target: "vigil::scheduler", schedule = %expr_label, "schedule has no future firings");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!(target: "vigil::scheduler", next = %next, wait_ms = wait.as_millis() as u64, "waiting for next sweep");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                sweep().await;
            }
            info!(target: "vigil::scheduler", "sweep loop exited");
        });

        let mut slot = self.sweep_task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Halts future sweeps and timers. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        info!(target: "vigil::scheduler", "scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl TimerQueue for Scheduler {
    fn schedule_once(&self, delay: Duration, job: Job) -> bool {
        // subscribe before checking: a stop() landing in between is then either seen
        // here or delivered to the receiver as a change
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() || self.is_stopped() {
            debug!(target: "vigil::scheduler", "timer refused: scheduler stopped");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(target: "vigil::scheduler", "timer refused: no tokio runtime");
            return false;
        };
        runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => job.await,
                _ = shutdown.changed() => {
                    debug!(target: "vigil::scheduler", "armed timer dropped on shutdown");
                }
            }
        });
        true
    }
}
