//! Change events: typed Insert/Update/Remove deltas for resource collections.
//!
//! One mutation of the resource store produces one [`BasicEventUpdates`]; it
//! travels through the bus as a value and every subscriber gets its own copy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::resource::{Agent, Configuration, Destination, Resource};

/// Kind of change a delta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Insert,
    Update,
    Remove,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Insert => "insert",
            EventType::Update => "update",
            EventType::Remove => "remove",
        };
        write!(f, "{s}")
    }
}

/// One delta for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event<T> {
    pub item: T,
    #[serde(rename = "type")]
    pub event_type: EventType,
}

// ---------------------------------------------------------------------------
// EventCollection
// ---------------------------------------------------------------------------

/// Deltas of one distribution cycle, keyed by the resource's unique key.
///
/// Iteration follows first-insertion order. Including a key a second time
/// replaces its event in place.
#[derive(Debug, Clone)]
pub struct EventCollection<T> {
    events: Vec<Event<T>>,
    index: HashMap<String, usize>,
}

impl<T> Default for EventCollection<T> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Resource> EventCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or override the delta for `item`'s key.
    pub fn include(&mut self, item: T, event_type: EventType) {
        let event = Event { item, event_type };
        match self.index.get(event.item.unique_key()) {
            Some(&pos) => self.events[pos] = event,
            None => {
                self.index
                    .insert(event.item.unique_key().to_string(), self.events.len());
                self.events.push(event);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Event<T>> {
        self.index.get(key).map(|&pos| &self.events[pos])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }
}

impl<T> EventCollection<T> {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event<T>> {
        self.events.iter()
    }

    /// Consume the collection, yielding events in insertion order.
    pub fn into_events(self) -> Vec<Event<T>> {
        self.events
    }
}

impl<'a, T> IntoIterator for &'a EventCollection<T> {
    type Item = &'a Event<T>;
    type IntoIter = std::slice::Iter<'a, Event<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

impl<T: Resource> FromIterator<(T, EventType)> for EventCollection<T> {
    fn from_iter<I: IntoIterator<Item = (T, EventType)>>(iter: I) -> Self {
        let mut c = Self::new();
        for (item, event_type) in iter {
            c.include(item, event_type);
        }
        c
    }
}

// ---------------------------------------------------------------------------
// BasicEventUpdates
// ---------------------------------------------------------------------------

/// All deltas produced by one store mutation, split by resource kind.
#[derive(Debug, Clone, Default)]
pub struct BasicEventUpdates {
    pub agents: EventCollection<Agent>,
    pub configurations: EventCollection<Configuration>,
    pub destinations: EventCollection<Destination>,
}

impl BasicEventUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agents(&self) -> &EventCollection<Agent> {
        &self.agents
    }

    pub fn configurations(&self) -> &EventCollection<Configuration> {
        &self.configurations
    }

    pub fn destinations(&self) -> &EventCollection<Destination> {
        &self.destinations
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.configurations.is_empty() && self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys<T: Resource>(c: &EventCollection<T>) -> Vec<String> {
        c.iter().map(|e| e.item.unique_key().to_string()).collect()
    }

    #[test]
    fn test_collection_new_is_empty() {
        let c: EventCollection<Agent> = EventCollection::new();
        assert!(c.is_empty());
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_collection_preserves_insertion_order() {
        let mut c = EventCollection::new();
        c.include(Agent::new("b", "b"), EventType::Insert);
        c.include(Agent::new("a", "a"), EventType::Insert);
        c.include(Agent::new("c", "c"), EventType::Update);
        assert_eq!(keys(&c), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_collection_last_write_wins_in_place() {
        let mut c = EventCollection::new();
        c.include(Agent::new("a", "first"), EventType::Insert);
        c.include(Agent::new("b", "b"), EventType::Insert);
        c.include(Agent::new("a", "second"), EventType::Remove);

        assert_eq!(c.len(), 2);
        assert_eq!(keys(&c), vec!["a", "b"]);
        let a = c.get("a").unwrap();
        assert_eq!(a.event_type, EventType::Remove);
        assert_eq!(a.item.name, "second");
    }

    #[test]
    fn test_collection_clone_is_independent() {
        let mut original = EventCollection::new();
        original.include(Agent::new("a", "a"), EventType::Update);
        let mut copy = original.clone();
        copy.include(Agent::new("b", "b"), EventType::Update);
        assert_eq!(original.len(), 1);
        assert_eq!(copy.len(), 2);
        assert!(!original.contains_key("b"));
    }

    #[test]
    fn test_collection_from_iterator() {
        let c: EventCollection<Destination> = vec![
            (Destination::new("d-1"), EventType::Insert),
            (Destination::new("d-1"), EventType::Update),
        ]
        .into_iter()
        .collect();
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("d-1").unwrap().event_type, EventType::Update);
    }

    #[test]
    fn test_basic_updates_is_empty() {
        let mut u = BasicEventUpdates::new();
        assert!(u.is_empty());
        u.destinations.include(Destination::new("d-1"), EventType::Insert);
        assert!(!u.is_empty());
        assert!(u.agents().is_empty());
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::Remove.to_string(), "remove");
    }
}
