//! Fleet resources: agents, configurations and destinations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::selector::Selector;

/// Label key/value pairs attached to every resource.
///
/// Sorted so that printing and hashing are deterministic.
pub type Labels = BTreeMap<String, String>;

/// Common accessors every resource kind exposes.
///
/// The event model keys deltas by [`unique_key`](Resource::unique_key); the
/// filters read [`labels`](Resource::labels) and look search documents up by
/// the same key.
pub trait Resource: Clone + Send + Sync + 'static {
    fn unique_key(&self) -> &str;
    fn name(&self) -> &str;
    fn labels(&self) -> &Labels;
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// A telemetry-collecting agent registered with the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            labels: Labels::new(),
        }
    }

    /// Builder-style label setter.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl Resource for Agent {
    fn unique_key(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A collector configuration. Agents whose labels match `selector` run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
    /// Agent selector. An empty selector matches no agent.
    #[serde(default)]
    pub selector: Selector,
    /// Names of the destinations this configuration sends to.
    #[serde(default)]
    pub destinations: Vec<String>,
}

impl Configuration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            selector: Selector::default(),
            destinations: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destinations.push(destination.into());
        self
    }

    /// Whether `agent` runs this configuration.
    pub fn matches_agent(&self, agent: &Agent) -> bool {
        !self.selector.is_empty() && self.selector.matches(&agent.labels)
    }
}

impl Resource for Configuration {
    fn unique_key(&self) -> &str {
        &self.name
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// An exporter target that configurations route telemetry to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
}

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
        }
    }
}

impl Resource for Destination {
    fn unique_key(&self) -> &str {
        &self.name
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }
}
