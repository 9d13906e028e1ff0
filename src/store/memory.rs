//! In-process resource store.
//!
//! Every mutation updates the maps and the search indexes, then publishes a
//! single-delta [`BasicEventUpdates`] while still holding the write lock, so
//! subscribers observe changes in the order they were applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::ResourceStore;
use crate::error::Result;
use crate::eventbus::{Bus, BusConfig};
use crate::model::{
    Agent, BasicEventUpdates, Configuration, Destination, EventType, MemoryIndex, Resource,
    SearchIndex,
};

#[derive(Debug, Default)]
struct State {
    agents: BTreeMap<String, Agent>,
    configurations: BTreeMap<String, Configuration>,
    destinations: BTreeMap<String, Destination>,
}

/// [`ResourceStore`] held entirely in memory.
pub struct MemoryStore {
    state: RwLock<State>,
    updates: Bus<BasicEventUpdates>,
    agent_index: Arc<MemoryIndex>,
    configuration_index: Arc<MemoryIndex>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn upsert_type<T>(previous: &Option<T>) -> EventType {
    if previous.is_some() {
        EventType::Update
    } else {
        EventType::Insert
    }
}

impl MemoryStore {
    pub fn new(bus: BusConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            updates: Bus::new(bus),
            agent_index: Arc::new(MemoryIndex::new()),
            configuration_index: Arc::new(MemoryIndex::new()),
        }
    }

    /// Insert or replace an agent, keyed by id.
    pub async fn upsert_agent(&self, agent: Agent) -> EventType {
        let mut state = self.state.write().await;
        let previous = state.agents.insert(agent.id.clone(), agent.clone());
        self.agent_index.upsert(&agent.id, &agent.name, &agent.labels);

        let event_type = upsert_type(&previous);
        debug!(agent = %agent.id, change = %event_type, "agent stored");
        let mut updates = BasicEventUpdates::new();
        updates.agents.include(agent, event_type);
        self.updates.send(updates);
        event_type
    }

    pub async fn remove_agent(&self, id: &str) -> Option<Agent> {
        let mut state = self.state.write().await;
        let agent = state.agents.remove(id)?;
        self.agent_index.remove(id);

        debug!(agent = %id, "agent removed");
        let mut updates = BasicEventUpdates::new();
        updates.agents.include(agent.clone(), EventType::Remove);
        self.updates.send(updates);
        Some(agent)
    }

    pub async fn upsert_configuration(&self, configuration: Configuration) -> EventType {
        let mut state = self.state.write().await;
        let previous = state
            .configurations
            .insert(configuration.name.clone(), configuration.clone());
        self.configuration_index
            .upsert(&configuration.name, &configuration.name, &configuration.labels);

        let event_type = upsert_type(&previous);
        debug!(configuration = %configuration.name, change = %event_type, "configuration stored");
        let mut updates = BasicEventUpdates::new();
        updates.configurations.include(configuration, event_type);
        self.updates.send(updates);
        event_type
    }

    pub async fn remove_configuration(&self, name: &str) -> Option<Configuration> {
        let mut state = self.state.write().await;
        let configuration = state.configurations.remove(name)?;
        self.configuration_index.remove(name);

        debug!(configuration = %name, "configuration removed");
        let mut updates = BasicEventUpdates::new();
        updates
            .configurations
            .include(configuration.clone(), EventType::Remove);
        self.updates.send(updates);
        Some(configuration)
    }

    pub async fn upsert_destination(&self, destination: Destination) -> EventType {
        let mut state = self.state.write().await;
        let previous = state
            .destinations
            .insert(destination.unique_key().to_string(), destination.clone());

        let event_type = upsert_type(&previous);
        let mut updates = BasicEventUpdates::new();
        updates.destinations.include(destination, event_type);
        self.updates.send(updates);
        event_type
    }

    pub async fn remove_destination(&self, name: &str) -> Option<Destination> {
        let mut state = self.state.write().await;
        let destination = state.destinations.remove(name)?;

        let mut updates = BasicEventUpdates::new();
        updates
            .destinations
            .include(destination.clone(), EventType::Remove);
        self.updates.send(updates);
        Some(destination)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    fn updates(&self) -> &Bus<BasicEventUpdates> {
        &self.updates
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        Ok(self.state.read().await.agents.values().cloned().collect())
    }

    async fn configurations(&self) -> Result<Vec<Configuration>> {
        Ok(self.state.read().await.configurations.values().cloned().collect())
    }

    async fn configuration(&self, name: &str) -> Result<Option<Configuration>> {
        Ok(self.state.read().await.configurations.get(name).cloned())
    }

    async fn destination(&self, name: &str) -> Result<Option<Destination>> {
        Ok(self.state.read().await.destinations.get(name).cloned())
    }

    async fn agent_count(&self, configuration: &Configuration) -> Result<usize> {
        Ok(self
            .state
            .read()
            .await
            .agents
            .values()
            .filter(|a| configuration.matches_agent(a))
            .count())
    }

    fn agent_index(&self) -> Arc<dyn SearchIndex> {
        self.agent_index.clone()
    }

    fn configuration_index(&self) -> Arc<dyn SearchIndex> {
        self.configuration_index.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Query, Selector};

    fn web(id: &str) -> Agent {
        Agent::new(id, format!("web-{id}")).with_label("role", "web")
    }

    #[tokio::test]
    async fn test_upsert_agent_emits_insert_then_update() {
        let store = MemoryStore::default();
        let mut sub = store.updates().subscribe();

        assert_eq!(store.upsert_agent(web("1")).await, EventType::Insert);
        assert_eq!(store.upsert_agent(web("1")).await, EventType::Update);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.agents().get("1").unwrap().event_type, EventType::Insert);
        assert!(first.configurations().is_empty());
        let second = sub.recv().await.unwrap();
        assert_eq!(second.agents().get("1").unwrap().event_type, EventType::Update);
    }

    #[tokio::test]
    async fn test_remove_agent_emits_remove_and_unindexes() {
        let store = MemoryStore::default();
        store.upsert_agent(web("1")).await;
        let mut sub = store.updates().subscribe();

        let removed = store.remove_agent("1").await.unwrap();
        assert_eq!(removed.id, "1");
        let u = sub.recv().await.unwrap();
        assert_eq!(u.agents().get("1").unwrap().event_type, EventType::Remove);
        assert!(!store.agent_index().matches(&Query::parse("role:web"), "1"));
        assert!(store.remove_agent("1").await.is_none());
    }

    #[tokio::test]
    async fn test_agent_rename_reindexes() {
        let store = MemoryStore::default();
        store.upsert_agent(Agent::new("1", "old")).await;
        store.upsert_agent(Agent::new("1", "new")).await;
        let idx = store.agent_index();
        assert!(idx.matches(&Query::parse("name:new"), "1"));
        assert!(!idx.matches(&Query::parse("name:old"), "1"));
    }

    #[tokio::test]
    async fn test_agents_sharing_a_hostname_are_indexed_apart() {
        let store = MemoryStore::default();
        store.upsert_agent(Agent::new("1", "web").with_label("zone", "a")).await;
        store.upsert_agent(Agent::new("2", "web").with_label("zone", "b")).await;
        store.remove_agent("1").await;

        let idx = store.agent_index();
        assert!(idx.matches(&Query::parse("name:web"), "2"));
        assert!(!idx.matches(&Query::parse("name:web"), "1"));
        let labels: Vec<String> = idx
            .suggestions(&Query::parse("zone:"))
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(labels, vec!["zone:b"]);
    }

    #[tokio::test]
    async fn test_agent_count_uses_selector() {
        let store = MemoryStore::default();
        store.upsert_agent(web("1")).await;
        store.upsert_agent(web("2")).await;
        store.upsert_agent(Agent::new("3", "db-3").with_label("role", "db")).await;

        let web_cfg = Configuration::new("web").with_selector(Selector::parse("role=web").unwrap());
        let none_cfg = Configuration::new("none");
        assert_eq!(store.agent_count(&web_cfg).await.unwrap(), 2);
        assert_eq!(store.agent_count(&none_cfg).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_configuration_and_destination_lookups() {
        let store = MemoryStore::default();
        store.upsert_configuration(Configuration::new("c-1")).await;
        store.upsert_destination(Destination::new("d-1")).await;

        assert!(store.configuration("c-1").await.unwrap().is_some());
        assert!(store.configuration("c-2").await.unwrap().is_none());
        assert!(store.destination("d-1").await.unwrap().is_some());
        assert_eq!(store.configurations().await.unwrap().len(), 1);

        store.remove_configuration("c-1").await;
        store.remove_destination("d-1").await;
        assert!(store.configuration("c-1").await.unwrap().is_none());
        assert!(store.destination("d-1").await.unwrap().is_none());
    }
}
