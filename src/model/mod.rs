//! # Module: model
//!
//! The data model shared by the event and metrics halves of the engine.
//!
//! ## Sub-modules
//! - [`resource`]: agents, configurations, destinations and the [`Resource`] trait
//! - [`event`]: Insert/Update/Remove deltas and per-cycle collections
//! - [`selector`]: label selectors and the search-index capability
//! - [`metric`]: raw metric records, counter samples and graph metrics

pub mod event;
pub mod metric;
pub mod resource;
pub mod selector;

pub use event::{BasicEventUpdates, Event, EventCollection, EventType};
pub use metric::{
    EdgeMetric, GraphMetric, GraphMetrics, MetricRecord, MetricValue, RateMetric,
};
pub use resource::{Agent, Configuration, Destination, Labels, Resource};
pub use selector::{MemoryIndex, Query, SearchIndex, Selector, Suggestion};
