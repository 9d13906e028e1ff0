//! # Stage: Change Filtering
//!
//! ## Responsibility
//! Turn one distribution cycle's raw deltas into the view a particular
//! subscriber is allowed to see. A delta that moves an item out of the
//! subscriber's selector or search results becomes a Remove, so the client
//! drops its copy; deltas for visible items keep their original type.
//!
//! ## Guarantees
//! - Pure: inputs are never mutated; every call returns a fresh collection
//! - Remove deltas pass through unchanged
//! - `None` selector / query / index is the identity
//!
//! ## NOT Responsible For
//! - Parsing selectors or queries (see [`crate::model::selector`])
//! - Delivering the result (see [`crate::eventbus`])

use crate::model::{
    Agent, BasicEventUpdates, Configuration, EventCollection, EventType, Query, Resource,
    SearchIndex, Selector,
};

/// Re-type every delta whose item fails `visible` to Remove.
fn retype_invisible<T, F>(changes: &EventCollection<T>, visible: F) -> EventCollection<T>
where
    T: Resource,
    F: Fn(&T) -> bool,
{
    let mut out = EventCollection::new();
    for change in changes {
        let event_type = match change.event_type {
            EventType::Remove => EventType::Remove,
            t if visible(&change.item) => t,
            _ => EventType::Remove,
        };
        out.include(change.item.clone(), event_type);
    }
    out
}

/// Apply a label selector to any resource's deltas.
pub fn apply_selector_to_changes<T: Resource>(
    selector: Option<&Selector>,
    changes: &EventCollection<T>,
) -> EventCollection<T> {
    match selector {
        Some(selector) => retype_invisible(changes, |item| selector.matches(item.labels())),
        None => changes.clone(),
    }
}

/// Access filter for agent deltas.
pub fn apply_access_filter_to_changes(
    selector: Option<&Selector>,
    changes: &EventCollection<Agent>,
) -> EventCollection<Agent> {
    apply_selector_to_changes(selector, changes)
}

/// Apply a search query to any resource's deltas.
///
/// An item is visible when `index` says the document stored under
/// `item.unique_key()` matches `query`.
pub fn apply_query_to_changes<T: Resource>(
    query: Option<&Query>,
    index: Option<&dyn SearchIndex>,
    changes: &EventCollection<T>,
) -> EventCollection<T> {
    match (query, index) {
        (Some(query), Some(index)) => {
            retype_invisible(changes, |item| index.matches(query, item.unique_key()))
        }
        _ => changes.clone(),
    }
}

/// Query filter for agent deltas.
pub fn apply_query_filter_to_changes(
    query: Option<&Query>,
    index: Option<&dyn SearchIndex>,
    changes: &EventCollection<Agent>,
) -> EventCollection<Agent> {
    apply_query_to_changes(query, index, changes)
}

/// Configuration deltas for one cycle, including agent-driven side effects.
///
/// When any agent delta in the cycle is an Insert or Remove, agent counts may
/// have shifted, so every configuration in `all_configurations` is included
/// as an Update, replacing that configuration's own delta. Deltas for
/// configurations no longer in `all_configurations` are kept. The cycle's own
/// collection is cloned first and never mutated.
pub fn configuration_updates(
    updates: &BasicEventUpdates,
    all_configurations: &[Configuration],
) -> EventCollection<Configuration> {
    let agent_count_may_change = updates
        .agents()
        .iter()
        .any(|e| e.event_type != EventType::Update);

    if !agent_count_may_change {
        return updates.configurations().clone();
    }

    let mut out = updates.configurations().clone();
    for cfg in all_configurations {
        out.include(cfg.clone(), EventType::Update);
    }
    out
}
