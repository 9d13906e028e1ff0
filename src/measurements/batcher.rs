//! # Stage: Measurement Batching Pipeline
//!
//! ## Responsibility
//! Accepts metric payloads from agents, accumulates them in memory, and hands
//! one combined batch per flush interval (default 5 s) to the measurement
//! store. Two workers cooperate:
//!
//! ```text
//! accept_metrics ──► [accept queue] ──► accept worker ──► [save queue] ──► save worker ──► store
//!                       (bounded)        owns buffer        (bounded)
//! ```
//!
//! ## Guarantees
//! - Back-pressure: a full accept queue suspends the caller until space frees
//!   or the caller's token is cancelled
//! - No shared buffer: a flushed buffer moves into the save queue by value and
//!   the accept worker starts a fresh one
//! - Liveness over durability: a failed save is logged and dropped; the
//!   pipeline keeps running
//! - Graceful shutdown: [`MeasurementBatcher::shutdown`] cancels both workers,
//!   flushes what was already accepted, and waits for them to join
//!
//! ## NOT Responsible For
//! - Retrying failed saves
//! - Computing rates (that happens at query time, see [`super::rate`])

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::Measurements;
use crate::error::{Error, Result};
use crate::model::MetricRecord;

// ---------------------------------------------------------------------------
// BatcherConfig
// ---------------------------------------------------------------------------

/// Configuration for the [`MeasurementBatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// How often accumulated metrics are handed to the store.
    pub flush_interval_ms: u64,
    /// Payloads that may wait for the accept worker.
    pub accept_queue_capacity: usize,
    /// Flushed batches that may wait for the save worker.
    pub save_queue_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5_000,
            accept_queue_capacity: 100,
            save_queue_capacity: 10,
        }
    }
}

impl BatcherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// BatcherState
// ---------------------------------------------------------------------------

/// Lifecycle of a [`MeasurementBatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherState {
    /// Accepting metrics.
    Running,
    /// Shutdown requested; workers are flushing and joining.
    Draining,
    /// Both workers have exited.
    Stopped,
}

impl std::fmt::Display for BatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatcherState::Running => "running",
            BatcherState::Draining => "draining",
            BatcherState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// MeasurementBatcher
// ---------------------------------------------------------------------------

/// Ingestion front door for agent throughput metrics.
///
/// Must be created inside a tokio runtime; construction spawns the workers.
/// Dropping the batcher cancels them the same way [`shutdown`](Self::shutdown)
/// does, without waiting.
pub struct MeasurementBatcher {
    accept_tx: mpsc::Sender<Vec<MetricRecord>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl MeasurementBatcher {
    pub fn new(store: Arc<dyn Measurements>, cfg: BatcherConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(cfg.accept_queue_capacity.max(1));
        let (save_tx, save_rx) = mpsc::channel(cfg.save_queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_worker(
            cancel.clone(),
            cfg.flush_interval(),
            accept_rx,
            save_tx,
        ));
        tracker.spawn(save_worker(store, save_rx));
        tracker.close();

        info!(
            flush_interval_ms = cfg.flush_interval_ms,
            accept_queue_capacity = cfg.accept_queue_capacity,
            "measurement batcher started"
        );

        Self {
            accept_tx,
            cancel,
            tracker,
        }
    }

    /// Enqueue `metrics` for the next flush.
    ///
    /// # Errors
    /// - [`Error::Cancelled`] when `ctx` is cancelled before the payload is queued
    /// - [`Error::PipelineStopped`] once shutdown has begun
    pub async fn accept_metrics(
        &self,
        ctx: &CancellationToken,
        metrics: Vec<MetricRecord>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::PipelineStopped);
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            _ = self.cancel.cancelled() => Err(Error::PipelineStopped),
            sent = self.accept_tx.send(metrics) => sent.map_err(|_| Error::PipelineStopped),
        }
    }

    /// Stop both workers and wait for them to join.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if `ctx` fires first. The workers keep
    /// draining in the background; do not assume they have stopped.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<()> {
        self.cancel.cancel();
        tokio::select! {
            biased;
            _ = self.tracker.wait() => {
                info!("measurement batcher stopped");
                Ok(())
            }
            _ = ctx.cancelled() => Err(Error::Cancelled),
        }
    }

    pub fn state(&self) -> BatcherState {
        if !self.cancel.is_cancelled() {
            BatcherState::Running
        } else if self.tracker.is_empty() {
            BatcherState::Stopped
        } else {
            BatcherState::Draining
        }
    }
}

impl Drop for MeasurementBatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn hand_off(save_tx: &mpsc::Sender<Vec<MetricRecord>>, buffer: &mut Vec<MetricRecord>) {
    let batch = std::mem::take(buffer);
    let n = batch.len();
    if save_tx.send(batch).await.is_err() {
        error!(metrics = n, "save worker gone, dropping measurement batch");
    }
}

async fn accept_worker(
    cancel: CancellationToken,
    flush_interval: Duration,
    mut rx: mpsc::Receiver<Vec<MetricRecord>>,
    save_tx: mpsc::Sender<Vec<MetricRecord>>,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately
    ticker.tick().await;

    let mut buffer: Vec<MetricRecord> = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => buffer.extend(batch),
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    hand_off(&save_tx, &mut buffer).await;
                }
            }
        }
    }

    rx.close();
    while let Ok(batch) = rx.try_recv() {
        buffer.extend(batch);
    }
    if !buffer.is_empty() {
        debug!(metrics = buffer.len(), "flushing remaining measurements on shutdown");
        hand_off(&save_tx, &mut buffer).await;
    }
    debug!("accept worker stopped");
}

async fn save_worker(store: Arc<dyn Measurements>, mut rx: mpsc::Receiver<Vec<MetricRecord>>) {
    while let Some(batch) = rx.recv().await {
        let n = batch.len();
        match store.save_agent_metrics(batch).await {
            Ok(()) => debug!(metrics = n, "saved measurement batch"),
            Err(e) => error!(error = %e, metrics = n, "failed to save measurement batch, dropping it"),
        }
    }
    debug!("save worker stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
