//! Change feed tests: store mutations relayed through the Resolver and
//! narrowed per subscriber.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use fleetpulse::measurements::MemoryMeasurements;
use fleetpulse::model::{Agent, Configuration, EventType, Selector};
use fleetpulse::resolver::{Resolver, ResolverConfig};
use fleetpulse::store::{MemoryStore, ResourceStore};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn setup() -> (Arc<MemoryStore>, Resolver) {
    let store = Arc::new(MemoryStore::default());
    let resolver = Resolver::new(
        store.clone(),
        Arc::new(MemoryMeasurements::new()),
        ResolverConfig::default(),
    );
    (store, resolver)
}

fn agent(id: &str, env: &str) -> Agent {
    Agent::new(id, format!("host-{id}")).with_label("env", env)
}

// ---------------------------------------------------------------------------
// Agent feeds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_agent_leaving_selector_is_seen_as_remove() {
    let (store, resolver) = setup();
    let (mut prod, _u) = resolver.agent_changes("env=prod", "").unwrap();

    store.upsert_agent(agent("a-1", "prod")).await;
    let got = timeout(WAIT, prod.next()).await.unwrap().unwrap();
    assert_eq!(got[0].change_type, EventType::Insert);

    // relabelled out of the subscriber's view
    store.upsert_agent(agent("a-1", "dev")).await;
    let got = timeout(WAIT, prod.next()).await.unwrap().unwrap();
    assert_eq!(got[0].agent.id, "a-1");
    assert_eq!(got[0].change_type, EventType::Remove);
}

#[tokio::test]
async fn test_independent_subscribers_see_their_own_view() {
    let (store, resolver) = setup();
    let (mut prod, _p) = resolver.agent_changes("env=prod", "").unwrap();
    let (mut all, _a) = resolver.agent_changes("", "").unwrap();

    store.upsert_agent(agent("a-1", "dev")).await;

    let p = timeout(WAIT, prod.next()).await.unwrap().unwrap();
    let a = timeout(WAIT, all.next()).await.unwrap().unwrap();
    assert_eq!(p[0].change_type, EventType::Remove);
    assert_eq!(a[0].change_type, EventType::Insert);
}

#[tokio::test]
async fn test_agent_feed_as_stream() {
    let (store, resolver) = setup();
    let (latest, _u) = resolver.agent_changes("", "").unwrap();
    let mut stream = Box::pin(latest.into_stream());

    store.upsert_agent(agent("a-9", "prod")).await;
    let got = timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(got[0].agent.id, "a-9");
}

#[tokio::test]
async fn test_unsubscribe_ends_feed() {
    let (store, resolver) = setup();
    let (mut latest, u) = resolver.agent_changes("", "").unwrap();
    u.unsubscribe();
    store.upsert_agent(agent("a-1", "prod")).await;
    assert_eq!(timeout(WAIT, latest.next()).await.unwrap(), None);
}

// ---------------------------------------------------------------------------
// Configuration feeds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_configuration_feed_filters_by_selector_and_counts_agents() {
    let (store, resolver) = setup();
    store
        .upsert_configuration(
            Configuration::new("linux-prod")
                .with_label("platform", "linux")
                .with_selector(Selector::parse("env=prod").unwrap()),
        )
        .await;
    store
        .upsert_configuration(Configuration::new("windows").with_label("platform", "windows"))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (mut linux, _u) = resolver.configuration_changes("platform=linux", "").unwrap();
    store.upsert_agent(agent("a-1", "prod")).await;

    let got = timeout(WAIT, linux.next()).await.unwrap().unwrap();
    let linux_prod = got
        .iter()
        .find(|c| c.configuration.name == "linux-prod")
        .unwrap();
    assert_eq!(linux_prod.change_type, EventType::Update);
    assert_eq!(linux_prod.agent_count, 1);
    let windows = got.iter().find(|c| c.configuration.name == "windows").unwrap();
    assert_eq!(windows.change_type, EventType::Remove);
}

#[tokio::test]
async fn test_close_stops_relaying_store_changes() {
    let (store, resolver) = setup();
    let (mut latest, _u) = resolver.agent_changes("", "").unwrap();
    resolver.close();
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.upsert_agent(agent("a-1", "prod")).await;
    assert!(timeout(Duration::from_millis(100), latest.next()).await.is_err());
    assert_eq!(store.updates().subscribers(), 0);
}
