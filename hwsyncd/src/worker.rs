//! Periodic worker scheduling
//!
//! Every hardware-polling subsystem implements [`Worker`] and is driven by
//! [`spawn`]: one start hook, a work hook on a fixed interval, and an exit hook
//! run once the worker is stopped. A failing cycle is logged and skipped.

use async_trait::async_trait;
use hwsync_common::tracing;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;

/// Errors raised inside a worker cycle
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker interval must be greater than zero")]
    InvalidInterval,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected value {value:?} in {path}")]
    Parse { path: PathBuf, value: String },

    #[error("malformed backlight state: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("settings store error: {0}")]
    Settings(#[from] ConfigError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Fixed interval between two work cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSchedule {
    interval: Duration,
}

impl WorkerSchedule {
    pub fn new(interval: Duration) -> WorkerResult<Self> {
        if interval.is_zero() {
            return Err(WorkerError::InvalidInterval);
        }
        Ok(Self { interval })
    }

    pub fn from_millis(interval_ms: u64) -> WorkerResult<Self> {
        Self::new(Duration::from_millis(interval_ms))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// A unit of periodic work
#[async_trait]
pub trait Worker: Send + 'static {
    fn name(&self) -> &'static str;

    fn schedule(&self) -> WorkerSchedule;

    /// One-time setup, completes before the first work cycle
    async fn on_start(&mut self) -> WorkerResult<()>;

    /// Called every [`WorkerSchedule::interval`], and at [`Worker::next_deadline`]
    async fn on_work(&mut self) -> WorkerResult<()>;

    /// Final flush after the worker was asked to stop
    async fn on_exit(&mut self) -> WorkerResult<()>;

    /// Raised by collaborators when input is waiting for [`Worker::on_wake`]
    fn wake_signal(&self) -> Option<Arc<Notify>> {
        None
    }

    async fn on_wake(&mut self) -> WorkerResult<()> {
        Ok(())
    }

    /// Requests an extra work cycle ahead of the next tick
    fn next_deadline(&self) -> Option<Instant> {
        None
    }
}

/// Handle to a running worker task
pub struct WorkerHandle {
    name: &'static str,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the worker. Once this returns no further work cycle runs and the
    /// exit hook has completed.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("Worker {} task failed: {}", self.name, e);
        }
    }
}

/// Run `worker` on its own task
pub fn spawn<W: Worker>(mut worker: W) -> WorkerHandle {
    let name = worker.name();
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        info!("Starting worker {}", name);
        if let Err(e) = worker.on_start().await {
            error!("Worker {} failed to start: {}", name, e);
        }

        let period = worker.schedule().interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let wake = worker.wake_signal();

        loop {
            let deadline = worker.next_deadline();
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = notified(wake.as_deref()) => {
                    report(name, "wake", worker.on_wake().await);
                }
                _ = ticker.tick() => {
                    report(name, "work", worker.on_work().await);
                }
                _ = sleep_until(deadline) => {
                    report(name, "work", worker.on_work().await);
                }
            }
        }

        debug!("Worker {} stopping", name);
        if let Err(e) = worker.on_exit().await {
            warn!("Worker {} exit hook failed: {}", name, e);
        }
        info!("Worker {} stopped", name);
    });

    WorkerHandle {
        name,
        stop_tx: Some(stop_tx),
        task,
    }
}

fn report(name: &str, hook: &str, result: WorkerResult<()>) {
    if let Err(e) = result {
        warn!("Worker {} {} cycle failed: {}", name, hook, e);
    }
}

async fn notified(signal: Option<&Notify>) {
    match signal {
        Some(signal) => signal.notified().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
