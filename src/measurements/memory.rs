//! In-process measurement store.
//!
//! Keeps raw counter samples and answers queries by computing a rate per
//! series over the look-back window. The window is anchored at the newest
//! stored sample, not the wall clock, so replayed fixtures behave like live
//! data. Samples older than the retention period, measured back from the
//! newest sample, are pruned on every save.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{rate::rate, Measurements, QueryOptions};
use crate::error::Result;
use crate::model::metric::{ATTR_AGENT, ATTR_CONFIGURATION};
use crate::model::{MetricRecord, MetricValue, RateMetric};

/// How far behind the newest sample raw samples are kept by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// [`Measurements`] backed by a vector of samples.
#[derive(Debug)]
pub struct MemoryMeasurements {
    samples: RwLock<Vec<MetricRecord>>,
    retention: Duration,
}

impl Default for MemoryMeasurements {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl MemoryMeasurements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only samples within `retention` of the newest one. Queries for a
    /// longer period see at most this much history.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            samples: RwLock::new(Vec::new()),
            retention,
        }
    }

    /// Number of raw samples stored.
    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn rates<F>(&self, options: QueryOptions, keep: F) -> Vec<MetricRecord>
    where
        F: Fn(&MetricRecord) -> bool,
    {
        let samples = self.samples.read().await;
        let Some(newest) = samples.iter().map(|m| m.timestamp).max() else {
            return Vec::new();
        };
        let cutoff = newest.checked_sub(options.period);

        let mut series: BTreeMap<String, Vec<&MetricRecord>> = BTreeMap::new();
        for m in samples.iter() {
            if cutoff.is_some_and(|c| m.timestamp < c) || !keep(m) {
                continue;
            }
            series.entry(m.series_key()).or_default().push(m);
        }

        let mut out = Vec::with_capacity(series.len());
        for (key, mut points) in series {
            if points.len() < 2 {
                debug!(series = %key, "single sample in window, skipping");
                continue;
            }
            points.sort_by_key(|m| m.timestamp);
            let (first, last) = (points[0], points[points.len() - 1]);

            let computed = RateMetric::from_record(first)
                .and_then(|f| RateMetric::from_record(last).and_then(|l| rate(&f, &l)));
            match computed {
                Ok(r) => {
                    let mut record = last.clone();
                    record.value = MetricValue::Double(r.value);
                    record.start_timestamp = r.start_timestamp;
                    out.push(record);
                }
                Err(e) => debug!(series = %key, error = %e, "skipping series"),
            }
        }
        out
    }
}

#[async_trait]
impl Measurements for MemoryMeasurements {
    async fn save_agent_metrics(&self, metrics: Vec<MetricRecord>) -> Result<()> {
        let mut samples = self.samples.write().await;
        samples.extend(metrics);

        let cutoff = samples
            .iter()
            .map(|m| m.timestamp)
            .max()
            .and_then(|newest| newest.checked_sub(self.retention));
        if let Some(cutoff) = cutoff {
            let before = samples.len();
            samples.retain(|m| m.timestamp >= cutoff);
            let pruned = before - samples.len();
            if pruned > 0 {
                debug!(pruned, "dropped samples past retention");
            }
        }
        Ok(())
    }

    async fn agent_metrics(&self, ids: &[String], options: QueryOptions) -> Result<Vec<MetricRecord>> {
        Ok(self
            .rates(options, |m| {
                ids.is_empty()
                    || m.attribute(ATTR_AGENT)
                        .is_some_and(|a| ids.iter().any(|id| id == a))
            })
            .await)
    }

    async fn configuration_metrics(&self, name: &str, options: QueryOptions) -> Result<Vec<MetricRecord>> {
        Ok(self
            .rates(options, |m| m.attribute(ATTR_CONFIGURATION) == Some(name))
            .await)
    }

    async fn overview_metrics(&self, options: QueryOptions) -> Result<Vec<MetricRecord>> {
        Ok(self.rates(options, |_| true).await)
    }
}
