//! # Module: measurements
//!
//! Throughput metric storage contract, the batching pipeline that feeds it,
//! and counter rate computation.
//!
//! ## Sub-modules
//! - [`batcher`]: bounded ingestion with interval flushes to the store
//! - [`rate`]: per-second rates over monotonic counters
//! - [`memory`]: in-process [`Measurements`] implementation

pub mod batcher;
pub mod memory;
pub mod rate;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::MetricRecord;

pub use batcher::{BatcherConfig, BatcherState, MeasurementBatcher};
pub use memory::MemoryMeasurements;
pub use rate::rate;

/// Look-back period used when none is requested.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);

/// Options shared by every measurement query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// How far back from the newest sample to look.
    pub period: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
        }
    }
}

impl QueryOptions {
    pub fn with_period(period: Duration) -> Self {
        Self { period }
    }
}

/// The measurement store the batching pipeline writes to and the graph
/// queries read from.
///
/// Query results are one record per series whose value is already a rate.
#[async_trait]
pub trait Measurements: Send + Sync {
    /// Persist one batch of raw samples.
    async fn save_agent_metrics(&self, metrics: Vec<MetricRecord>) -> Result<()>;

    /// Rates for the given agents; an empty slice means all agents.
    async fn agent_metrics(&self, ids: &[String], options: QueryOptions) -> Result<Vec<MetricRecord>>;

    /// Rates reported by agents running configuration `name`.
    async fn configuration_metrics(&self, name: &str, options: QueryOptions) -> Result<Vec<MetricRecord>>;

    /// Rates across the whole fleet.
    async fn overview_metrics(&self, options: QueryOptions) -> Result<Vec<MetricRecord>>;
}
