//! Metric records reported by agents and the graph metrics derived from them.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Attribute naming the agent that reported a metric.
pub const ATTR_AGENT: &str = "agent";
/// Attribute naming the configuration the agent was running.
pub const ATTR_CONFIGURATION: &str = "configuration";
/// Attribute naming the throughput measurement processor.
pub const ATTR_PROCESSOR: &str = "processor";

pub const METRIC_DATA_SIZE: &str = "metric_data_size";
pub const LOG_DATA_SIZE: &str = "log_data_size";
pub const TRACE_DATA_SIZE: &str = "trace_data_size";

/// Throughput metric names the graph views understand.
pub const GRAPH_METRIC_NAMES: [&str; 3] = [METRIC_DATA_SIZE, LOG_DATA_SIZE, TRACE_DATA_SIZE];

// ---------------------------------------------------------------------------
// MetricRecord
// ---------------------------------------------------------------------------

/// The scalar carried by a metric record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Double(f64),
    Text(String),
}

impl MetricValue {
    /// Numeric value, or `None` for non-scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Double(d) => Some(*d),
            MetricValue::Text(_) => None,
        }
    }
}

/// One raw sample as reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub name: String,
    #[serde(with = "unix_millis")]
    pub timestamp: SystemTime,
    /// When the counter last reset.
    #[serde(with = "unix_millis")]
    pub start_timestamp: SystemTime,
    pub value: MetricValue,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, value: MetricValue) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.into(),
            timestamp: now,
            start_timestamp: now,
            value,
            unit: "B/s".to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamps(mut self, start: SystemTime, timestamp: SystemTime) -> Self {
        self.start_timestamp = start;
        self.timestamp = timestamp;
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Attribute that aggregation cannot do without.
    pub fn required_attribute(&self, key: &str) -> Result<&str> {
        self.attribute(key).ok_or_else(|| Error::MissingAttribute {
            name: self.name.clone(),
            attribute: key.to_string(),
        })
    }

    /// Scalar value, or [`Error::UnsupportedValue`].
    pub fn scalar(&self) -> Result<f64> {
        self.value.as_f64().ok_or_else(|| Error::UnsupportedValue {
            name: self.name.clone(),
        })
    }

    /// Identity of the series this sample belongs to: name plus attributes.
    pub fn series_key(&self) -> String {
        let attrs: Vec<String> = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}{{{}}}", self.name, attrs.join(","))
    }
}

// ---------------------------------------------------------------------------
// RateMetric
// ---------------------------------------------------------------------------

/// One sample of a monotonic counter, counted since `start_timestamp`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateMetric {
    pub timestamp: SystemTime,
    pub start_timestamp: SystemTime,
    pub value: f64,
}

impl RateMetric {
    /// View a raw record as a counter sample.
    pub fn from_record(record: &MetricRecord) -> Result<Self> {
        Ok(Self {
            timestamp: record.timestamp,
            start_timestamp: record.start_timestamp,
            value: record.scalar()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Graph metrics
// ---------------------------------------------------------------------------

/// Aggregated value for one (pipeline type, node) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetric {
    pub name: String,
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub pipeline_type: String,
    pub value: f64,
    pub unit: String,
    #[serde(rename = "agentID", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Aggregated value for one (pipeline type, configuration→destination) edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeMetric {
    pub name: String,
    #[serde(rename = "edgeID")]
    pub edge_id: String,
    pub pipeline_type: String,
    pub value: f64,
    pub unit: String,
}

/// A renderable topology: node and edge totals plus per-type maxima.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetrics {
    pub metrics: Vec<GraphMetric>,
    pub edge_metrics: Vec<EdgeMetric>,
    pub max_metric_value: f64,
    pub max_log_value: f64,
    pub max_trace_value: f64,
}

impl GraphMetrics {
    /// Node metric by name and node id.
    pub fn node(&self, name: &str, node_id: &str) -> Option<&GraphMetric> {
        self.metrics
            .iter()
            .find(|m| m.name == name && m.node_id == node_id)
    }

    /// Edge metric by name and edge id.
    pub fn edge(&self, name: &str, edge_id: &str) -> Option<&EdgeMetric> {
        self.edge_metrics
            .iter()
            .find(|m| m.name == name && m.edge_id == edge_id)
    }
}

// ---------------------------------------------------------------------------
// serde helpers
// ---------------------------------------------------------------------------

/// `SystemTime` as integer milliseconds since the Unix epoch.
mod unix_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> std::result::Result<S::Ok, S::Error> {
        let ms = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        s.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<SystemTime, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_millis(ms))
    }
}
