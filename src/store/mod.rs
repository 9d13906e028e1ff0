//! # Module: store
//!
//! The resource store contract: current agents, configurations and
//! destinations, plus a bus announcing every change to them.
//!
//! ## Sub-modules
//! - [`memory`]: in-process [`ResourceStore`] used by tests and the CLI

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::eventbus::Bus;
use crate::model::{Agent, BasicEventUpdates, Configuration, Destination, SearchIndex};

pub use memory::MemoryStore;

/// Source of fleet resources and their change notifications.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Bus carrying one [`BasicEventUpdates`] per mutation.
    fn updates(&self) -> &Bus<BasicEventUpdates>;

    async fn agents(&self) -> Result<Vec<Agent>>;

    async fn configurations(&self) -> Result<Vec<Configuration>>;

    async fn configuration(&self, name: &str) -> Result<Option<Configuration>>;

    async fn destination(&self, name: &str) -> Result<Option<Destination>>;

    /// Number of agents `configuration`'s selector matches.
    async fn agent_count(&self, configuration: &Configuration) -> Result<usize>;

    /// Search index over agents, keyed by agent id.
    fn agent_index(&self) -> Arc<dyn SearchIndex>;

    /// Search index over configurations, keyed by configuration name.
    fn configuration_index(&self) -> Arc<dyn SearchIndex>;
}
