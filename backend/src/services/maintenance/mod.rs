//! Recurring background jobs.
//!
//! Every job wakes on a short interval, runs at most one body at a time and
//! only does real work once its own minimum interval has passed since the
//! last successful run. Arming counts as a run, so the first body runs one
//! full interval after the job is created.

pub mod cleaner;
pub mod client_access;
pub mod key_rotation;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

pub use cleaner::{ExpiredEntryCleaner, SweepReport};
pub use client_access::{ClientAccessFlush, ClientAccessTracker};
pub use key_rotation::KeyRotation;

#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimum time between two successful runs.
    fn min_interval(&self) -> Duration;

    async fn run(&self) -> anyhow::Result<()>;
}

/// Atomic "running" flag shared by the ticks of one job.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the flag, or `None` when a body is already running.
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flight: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the flag when dropped, including during unwinding.
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running the body.
    Skipped,
    /// The minimum interval since the last success has not passed.
    NotDue,
    Completed,
    Failed,
}

pub struct ScheduledJob<T> {
    task: T,
    wake_interval: Duration,
    flight: SingleFlight,
    base: Instant,
    /// Milliseconds after `base` of the last successful run; starts at the arm instant.
    last_success_ms: AtomicI64,
}

impl<T: MaintenanceTask + 'static> ScheduledJob<T> {
    pub fn new(task: T, wake_interval: Duration) -> Self {
        Self {
            task,
            wake_interval,
            flight: SingleFlight::new(),
            base: Instant::now(),
            last_success_ms: AtomicI64::new(0),
        }
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    fn elapsed_ms(&self) -> i64 {
        self.base.elapsed().as_millis() as i64
    }

    fn is_due(&self) -> bool {
        let last = self.last_success_ms.load(Ordering::Acquire);
        let min_interval = i64::try_from(self.task.min_interval().as_millis()).unwrap_or(i64::MAX);
        self.elapsed_ms().saturating_sub(last) >= min_interval
    }

    /// One wake-up. Overlapping ticks are skipped, never queued.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = self.flight.try_acquire() else {
            tracing::trace!(job = self.task.name(), "Previous run still in progress, skipping");
            return TickOutcome::Skipped;
        };
        if !self.is_due() {
            return TickOutcome::NotDue;
        }

        let started = Instant::now();
        match self.task.run().await {
            Ok(()) => {
                self.last_success_ms
                    .store(self.elapsed_ms(), Ordering::Release);
                tracing::debug!(
                    job = self.task.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Maintenance job finished"
                );
                TickOutcome::Completed
            }
            Err(err) => {
                tracing::error!(job = self.task.name(), "Maintenance job failed: {:#}", err);
                TickOutcome::Failed
            }
        }
    }

    /// Wakes every `wake_interval` and fires a tick without waiting for the
    /// previous one, so a slow body makes later ticks skip.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                job = self.task.name(),
                wake_interval_secs = self.wake_interval.as_secs(),
                "Maintenance job armed"
            );
            let mut ticker = interval(self.wake_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let job = Arc::clone(&self);
                tokio::spawn(async move {
                    job.tick().await;
                });
            }
        })
    }
}
