//! # Stage: Graph Metrics Assembly
//!
//! ## Responsibility
//! Fold per-series throughput rates into the node and edge totals a topology
//! view renders. Every rate carries a `processor` attribute naming the
//! throughput measurement processor that produced it:
//!
//! ```text
//! throughputmeasurement/_d1_logs_d-1/2
//!                        ── ──── ───
//!                   position  │   resource (per-pipeline copy suffix `/2` dropped)
//!                      pipeline type
//! ```
//!
//! ## Guarantees
//! - Overview totals only count configurations that have at least one agent
//!   and destinations that still exist ("zombie" data is excluded)
//! - Store lookup failures exclude the item rather than failing the view
//! - A malformed metric is skipped; the rest of the batch still counts
//! - Maxima are computed per call from the produced node metrics
//!
//! ## NOT Responsible For
//! - Computing rates (see [`crate::measurements::rate`])
//! - Deciding which metrics to load (see [`crate::resolver`])

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::metric::{ATTR_AGENT, ATTR_CONFIGURATION, ATTR_PROCESSOR, GRAPH_METRIC_NAMES};
use crate::model::{EdgeMetric, GraphMetric, GraphMetrics, MetricRecord};
use crate::store::ResourceStore;

const PROCESSOR_PREFIX: &str = "throughputmeasurement/_";

pub const EVERYTHING_CONFIGURATION: &str = "everything/configuration";
pub const EVERYTHING_DESTINATION: &str = "everything/destination";

// ---------------------------------------------------------------------------
// ProcessorName
// ---------------------------------------------------------------------------

/// Where in a pipeline a throughput measurement processor sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    /// Source, before processors (`s0`).
    SourceBefore,
    /// Source, after processors (`s1`).
    SourceAfter,
    /// Destination, before processors (`d0`).
    DestinationBefore,
    /// Destination, after processors (`d1`).
    DestinationAfter,
}

impl Position {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "s0" => Some(Position::SourceBefore),
            "s1" => Some(Position::SourceAfter),
            "d0" => Some(Position::DestinationBefore),
            "d1" => Some(Position::DestinationAfter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Position::SourceBefore => "s0",
            Position::SourceAfter => "s1",
            Position::DestinationBefore => "d0",
            Position::DestinationAfter => "d1",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed throughput measurement processor name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorName {
    pub position: Position,
    pub pipeline_type: String,
    /// Logical resource name, per-pipeline copy suffix removed.
    pub resource_name: String,
}

impl ProcessorName {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidProcessorName(s.to_string());
        let rest = s.strip_prefix(PROCESSOR_PREFIX).ok_or_else(invalid)?;

        let mut parts = rest.splitn(3, '_');
        let position = parts.next().and_then(Position::parse).ok_or_else(invalid)?;
        let pipeline_type = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let resource = parts.next().filter(|r| !r.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            position,
            pipeline_type: pipeline_type.to_string(),
            resource_name: strip_copy_suffix(resource).to_string(),
        })
    }
}

/// `d-1/2` → `d-1`. Only an all-digit final segment is a copy suffix.
fn strip_copy_suffix(name: &str) -> &str {
    match name.rsplit_once('/') {
        Some((base, n)) if !base.is_empty() && !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => base,
        _ => name,
    }
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

/// Which configurations and destinations are live right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deployment {
    /// Configurations with at least one matching agent.
    pub configurations: HashSet<String>,
    /// Destinations that exist in the store.
    pub destinations: HashSet<String>,
}

impl Deployment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configuration(mut self, name: impl Into<String>) -> Self {
        self.configurations.insert(name.into());
        self
    }

    pub fn with_destination(mut self, name: impl Into<String>) -> Self {
        self.destinations.insert(name.into());
        self
    }

    /// Look up every configuration and destination referenced by `metrics`.
    ///
    /// Anything the store cannot answer for counts as not deployed.
    pub async fn resolve(store: &dyn ResourceStore, metrics: &[MetricRecord]) -> Self {
        let mut configurations = HashSet::new();
        let mut destinations = HashSet::new();
        for m in metrics {
            if let Some(cfg) = m.attribute(ATTR_CONFIGURATION) {
                configurations.insert(cfg.to_string());
            }
            if let Some(p) = m.attribute(ATTR_PROCESSOR).and_then(|p| ProcessorName::parse(p).ok()) {
                if p.position == Position::DestinationAfter {
                    destinations.insert(p.resource_name);
                }
            }
        }

        let mut deployment = Deployment::new();
        for name in configurations {
            let configuration = match store.configuration(&name).await {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    debug!(configuration = %name, error = %e, "configuration lookup failed, treating as not deployed");
                    continue;
                }
            };
            match store.agent_count(&configuration).await {
                Ok(n) if n > 0 => {
                    deployment.configurations.insert(name);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(configuration = %name, error = %e, "agent count failed, treating as not deployed");
                }
            }
        }
        for name in destinations {
            match store.destination(&name).await {
                Ok(Some(_)) => {
                    deployment.destinations.insert(name);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(destination = %name, error = %e, "destination lookup failed, treating as not deployed");
                }
            }
        }
        deployment
    }

    fn is_deployed(&self, configuration: &str, destination: &str) -> bool {
        self.configurations.contains(configuration) && self.destinations.contains(destination)
    }
}

// ---------------------------------------------------------------------------
// Accumulation
// ---------------------------------------------------------------------------

/// Sums node and edge values keyed by (pipeline type, id), in first-seen order.
#[derive(Default)]
struct Accumulator {
    nodes: Vec<GraphMetric>,
    node_index: HashMap<(String, String, Option<String>), usize>,
    edges: Vec<EdgeMetric>,
    edge_index: HashMap<(String, String), usize>,
}

impl Accumulator {
    fn add_node(&mut self, m: &MetricRecord, pipeline_type: &str, node_id: String, agent_id: Option<String>, value: f64) {
        let key = (pipeline_type.to_string(), node_id, agent_id);
        if let Some(&i) = self.node_index.get(&key) {
            self.nodes[i].value += value;
            return;
        }
        self.node_index.insert(key.clone(), self.nodes.len());
        let (pipeline_type, node_id, agent_id) = key;
        self.nodes.push(GraphMetric {
            name: m.name.clone(),
            node_id,
            pipeline_type,
            value,
            unit: m.unit.clone(),
            agent_id,
        });
    }

    fn add_edge(&mut self, m: &MetricRecord, pipeline_type: &str, edge_id: String, value: f64) {
        let key = (pipeline_type.to_string(), edge_id);
        if let Some(&i) = self.edge_index.get(&key) {
            self.edges[i].value += value;
            return;
        }
        self.edge_index.insert(key.clone(), self.edges.len());
        let (pipeline_type, edge_id) = key;
        self.edges.push(EdgeMetric {
            name: m.name.clone(),
            edge_id,
            pipeline_type,
            value,
            unit: m.unit.clone(),
        });
    }

    fn finish(self) -> GraphMetrics {
        let max_of = |name: &str| {
            self.nodes
                .iter()
                .filter(|m| m.name == name)
                .map(|m| m.value)
                .fold(0.0_f64, f64::max)
        };
        let [max_metric_value, max_log_value, max_trace_value] = GRAPH_METRIC_NAMES.map(max_of);
        GraphMetrics {
            metrics: self.nodes,
            edge_metrics: self.edges,
            max_metric_value,
            max_log_value,
            max_trace_value,
        }
    }
}

/// Processor name and value, or the reason the metric cannot be used.
fn decode(m: &MetricRecord) -> Result<(ProcessorName, f64)> {
    let processor = ProcessorName::parse(m.required_attribute(ATTR_PROCESSOR)?)?;
    Ok((processor, m.scalar()?))
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

fn is_selected(name: &str, ids: &[String]) -> bool {
    ids.iter()
        .any(|id| id == name || id.strip_suffix(name).is_some_and(|head| head.ends_with('/')))
}

/// Node id for `name`, or the rollup id when a selection excludes it.
///
/// `None` means there is no selection and every resource gets its own node.
fn overview_node_id(kind: &str, name: &str, selection: Option<&[String]>, rollup: &str) -> String {
    match selection {
        Some(ids) if !is_selected(name, ids) => rollup.to_string(),
        _ => format!("{kind}/{name}"),
    }
}

/// Fleet-wide topology: configuration → destination totals.
///
/// Only destination-after-processors metrics count, and only when both the
/// owning configuration and the destination are in `deployment`.
pub fn assemble_overview(
    metrics: &[MetricRecord],
    deployment: &Deployment,
    configuration_ids: Option<&[String]>,
    destination_ids: Option<&[String]>,
) -> GraphMetrics {
    let mut acc = Accumulator::default();

    for m in metrics {
        let (processor, value) = match decode(m) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(metric = %m.name, error = %e, "skipping metric");
                continue;
            }
        };
        if processor.position != Position::DestinationAfter {
            continue;
        }
        let configuration = match m.required_attribute(ATTR_CONFIGURATION) {
            Ok(c) => c,
            Err(e) => {
                debug!(metric = %m.name, error = %e, "skipping metric");
                continue;
            }
        };
        let destination = processor.resource_name.as_str();
        if !deployment.is_deployed(configuration, destination) {
            continue;
        }

        let destination_node =
            overview_node_id("destination", destination, destination_ids, EVERYTHING_DESTINATION);
        let configuration_node = overview_node_id(
            "configuration",
            configuration,
            configuration_ids,
            EVERYTHING_CONFIGURATION,
        );
        let edge_id = format!("{configuration_node}|{destination_node}");

        acc.add_node(m, &processor.pipeline_type, destination_node, None, value);
        acc.add_node(m, &processor.pipeline_type, configuration_node, None, value);
        acc.add_edge(m, &processor.pipeline_type, edge_id, value);
    }

    acc.finish()
}

// ---------------------------------------------------------------------------
// Per-page views
// ---------------------------------------------------------------------------

/// Maps a metric's processor position to a node in a page-specific graph.
pub trait NodeIdResolver: Send + Sync {
    /// Node id for the processor, or `None` to leave the metric out.
    fn node_id(&self, position: Position, pipeline_type: &str, resource_name: &str) -> Option<String>;

    /// Agent the node metric belongs to, if the view is per agent.
    fn agent_id(&self, _metric: &MetricRecord) -> Option<String> {
        None
    }
}

impl<F> NodeIdResolver for F
where
    F: Fn(Position, &str, &str) -> Option<String> + Send + Sync,
{
    fn node_id(&self, position: Position, pipeline_type: &str, resource_name: &str) -> Option<String> {
        self(position, pipeline_type, resource_name)
    }
}

fn page_node_id(position: Position, resource_name: &str) -> String {
    match position {
        Position::SourceBefore => format!("source/{resource_name}"),
        Position::SourceAfter => format!("source/{resource_name}/processors"),
        Position::DestinationBefore => format!("destination/{resource_name}/processors"),
        Position::DestinationAfter => format!("destination/{resource_name}"),
    }
}

/// Node ids for a configuration's pipeline graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigurationNodeIds;

impl NodeIdResolver for ConfigurationNodeIds {
    fn node_id(&self, position: Position, _pipeline_type: &str, resource_name: &str) -> Option<String> {
        Some(page_node_id(position, resource_name))
    }
}

/// Like [`ConfigurationNodeIds`], but keeps each agent's numbers apart.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentNodeIds;

impl NodeIdResolver for AgentNodeIds {
    fn node_id(&self, position: Position, _pipeline_type: &str, resource_name: &str) -> Option<String> {
        Some(page_node_id(position, resource_name))
    }

    fn agent_id(&self, metric: &MetricRecord) -> Option<String> {
        metric.attribute(ATTR_AGENT).map(str::to_string)
    }
}

/// Graph for a single configuration or agent page.
///
/// Every position counts; no deployment filtering and no edges.
pub fn assign_metrics_to_graph(metrics: &[MetricRecord], resolver: &dyn NodeIdResolver) -> GraphMetrics {
    let mut acc = Accumulator::default();
    for m in metrics {
        let (processor, value) = match decode(m) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(metric = %m.name, error = %e, "skipping metric");
                continue;
            }
        };
        let Some(node_id) = resolver.node_id(processor.position, &processor.pipeline_type, &processor.resource_name)
        else {
            continue;
        };
        acc.add_node(m, &processor.pipeline_type, node_id, resolver.agent_id(m), value);
    }
    acc.finish()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
