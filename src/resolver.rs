//! # Stage: Resolver
//!
//! ## Responsibility
//! The surface the presentation layer talks to. It turns store change
//! notifications into per-subscriber change feeds, answers one-shot graph
//! queries, and runs polling subscriptions that push a fresh
//! [`GraphMetrics`] on a fixed cadence.
//!
//! ```text
//! store bus ──relay──► resolver bus ──► filter task ──► Latest<Vec<AgentChange>>
//!                                   └─► filter task ──► Latest<Vec<ConfigurationChange>>
//!
//! ticker ──► measurements ──► graph assembly ──► Latest<GraphMetrics>
//! ```
//!
//! ## Guarantees
//! - One-shot queries return the first hard error
//! - A failed poll is logged and skipped; the subscription keeps running
//! - [`Resolver::close`] stops the relay and every polling subscription
//!
//! ## NOT Responsible For
//! - Transport (GraphQL, HTTP, websockets)
//! - Persisting anything

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::eventbus::{relay, subscribe_with_filter, Bus, BusConfig, Latest, Unsubscribe};
use crate::filter::{
    apply_access_filter_to_changes, apply_query_filter_to_changes, apply_query_to_changes,
    apply_selector_to_changes, configuration_updates,
};
use crate::graph::{
    assemble_overview, assign_metrics_to_graph, AgentNodeIds, ConfigurationNodeIds, Deployment,
};
use crate::measurements::{Measurements, QueryOptions, DEFAULT_PERIOD};
use crate::model::{
    Agent, BasicEventUpdates, Configuration, Event, EventType, GraphMetrics, Query, Selector,
    Suggestion,
};
use crate::store::ResourceStore;

/// Consecutive poll failures after which logging escalates to `error`.
const FAILURE_ESCALATION: u32 = 5;

// ---------------------------------------------------------------------------
// ResolverConfig
// ---------------------------------------------------------------------------

/// Polling cadence and query defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub agent_metrics_interval_ms: u64,
    pub configuration_metrics_interval_ms: u64,
    pub overview_metrics_interval_ms: u64,
    /// Period used when a request leaves it blank.
    pub default_period: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            agent_metrics_interval_ms: 10_000,
            configuration_metrics_interval_ms: 10_000,
            overview_metrics_interval_ms: 10_000,
            default_period: "1m".to_string(),
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

// ---------------------------------------------------------------------------
// Period parsing
// ---------------------------------------------------------------------------

/// Parse a look-back period such as `30s`, `15m` or `1h30m`.
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`; fractions such as
/// `1.5h` are accepted. A blank string is one minute.
///
/// # Errors
/// [`Error::InvalidPeriod`] for anything else.
pub fn parse_period(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(DEFAULT_PERIOD);
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let invalid = || Error::InvalidPeriod(s.to_string());

    let mut total: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (num, tail) = rest.split_at(num_end);
        let (whole, frac) = num.split_once('.').unwrap_or((num, ""));
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') || frac.len() > 18 {
            return Err(invalid());
        }

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };

        let digits = |d: &str| -> Result<u128> {
            if d.is_empty() {
                return Ok(0);
            }
            d.parse::<u128>().map_err(|_| invalid())
        };
        let whole_ns = digits(whole)?.checked_mul(scale).ok_or_else(invalid)?;
        let frac_ns = digits(frac)?.saturating_mul(scale) / 10u128.pow(frac.len() as u32);
        total = total
            .checked_add(whole_ns)
            .and_then(|t| t.checked_add(frac_ns))
            .ok_or_else(invalid)?;
        rest = tail;
    }
    u64::try_from(total)
        .map(Duration::from_nanos)
        .map_err(|_| invalid())
}

fn parse_selector(s: &str) -> Result<Option<Selector>> {
    if s.trim().is_empty() {
        return Ok(None);
    }
    Selector::parse(s).map(Some)
}

fn parse_query(s: &str) -> Option<Query> {
    Some(Query::parse(s)).filter(|q| !q.is_empty())
}

// ---------------------------------------------------------------------------
// Change payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentChange {
    pub agent: Agent,
    pub change_type: EventType,
}

impl From<Event<Agent>> for AgentChange {
    fn from(e: Event<Agent>) -> Self {
        Self {
            agent: e.item,
            change_type: e.event_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationChange {
    pub configuration: Configuration,
    pub change_type: EventType,
    /// Agents currently running the configuration; 0 once removed.
    pub agent_count: usize,
}

// ---------------------------------------------------------------------------
// MetricsSubscription
// ---------------------------------------------------------------------------

/// A polling subscription. Dropping it stops the poller.
pub struct MetricsSubscription {
    latest: Latest<GraphMetrics>,
    _guard: DropGuard,
}

impl MetricsSubscription {
    /// The next graph, or `None` once the poller has stopped.
    pub async fn next(&mut self) -> Option<GraphMetrics> {
        self.latest.next().await
    }

    pub fn into_stream(self) -> impl futures_util::Stream<Item = GraphMetrics> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|g| (g, sub))
        })
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Entry point for change feeds and graph metrics.
///
/// Clone freely; clones share the relay and the lifetime token.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn ResourceStore>,
    measurements: Arc<dyn Measurements>,
    cfg: ResolverConfig,
    updates: Bus<BasicEventUpdates>,
    cancel: CancellationToken,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        measurements: Arc<dyn Measurements>,
        cfg: ResolverConfig,
    ) -> Self {
        Self::with_bus_config(store, measurements, cfg, BusConfig::default())
    }

    /// Like [`new`](Self::new), with explicit capacity for the resolver's bus.
    pub fn with_bus_config(
        store: Arc<dyn ResourceStore>,
        measurements: Arc<dyn Measurements>,
        cfg: ResolverConfig,
        bus: BusConfig,
    ) -> Self {
        let updates = Bus::new(bus);
        let cancel = CancellationToken::new();
        relay(cancel.child_token(), store.updates(), updates.clone());
        info!("resolver started");
        Self {
            store,
            measurements,
            cfg,
            updates,
            cancel,
        }
    }

    /// Stop the relay and every polling subscription.
    pub fn close(&self) {
        self.cancel.cancel();
        info!("resolver closed");
    }

    /// The resolver's own copy of the store change feed.
    pub fn updates(&self) -> &Bus<BasicEventUpdates> {
        &self.updates
    }

    fn period(&self, period: &str) -> Result<Duration> {
        if period.trim().is_empty() {
            return parse_period(&self.cfg.default_period);
        }
        parse_period(period)
    }

    // -----------------------------------------------------------------------
    // Change feeds
    // -----------------------------------------------------------------------

    /// Agent deltas visible through `selector` and `query`, newest cycle wins.
    ///
    /// Blank `selector` or `query` text applies no filter.
    pub fn agent_changes(
        &self,
        selector: &str,
        query: &str,
    ) -> Result<(Latest<Vec<AgentChange>>, Unsubscribe)> {
        let selector = parse_selector(selector)?;
        let query = parse_query(query);
        let index = self.store.agent_index();

        Ok(subscribe_with_filter(&self.updates, move |updates: BasicEventUpdates| {
            if updates.agents().is_empty() {
                return None;
            }
            let changes = apply_access_filter_to_changes(selector.as_ref(), updates.agents());
            let changes = apply_query_filter_to_changes(query.as_ref(), Some(index.as_ref()), &changes);
            Some(changes.into_events().into_iter().map(AgentChange::from).collect())
        }))
    }

    /// Configuration deltas, including agent-count changes caused by agents
    /// joining or leaving the fleet.
    pub fn configuration_changes(
        &self,
        selector: &str,
        query: &str,
    ) -> Result<(Latest<Vec<ConfigurationChange>>, Unsubscribe)> {
        let selector = parse_selector(selector)?;
        let query = parse_query(query);
        let store = Arc::clone(&self.store);
        let index = store.configuration_index();

        let mut sub = self.updates.subscribe();
        let unsubscribe = sub.unsubscriber();
        let (tx, latest) = Latest::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    updates = sub.recv() => {
                        let Some(updates) = updates else { break };
                        if updates.agents().is_empty() && updates.configurations().is_empty() {
                            continue;
                        }

                        let all = if updates.agents().is_empty() {
                            Vec::new()
                        } else {
                            store.configurations().await.unwrap_or_else(|e| {
                                warn!(error = %e, "listing configurations failed");
                                Vec::new()
                            })
                        };
                        let changes = configuration_updates(&updates, &all);
                        let changes = apply_selector_to_changes(selector.as_ref(), &changes);
                        let changes = apply_query_to_changes(query.as_ref(), Some(index.as_ref()), &changes);
                        if changes.is_empty() {
                            continue;
                        }

                        let mut out = Vec::with_capacity(changes.len());
                        for e in changes.into_events() {
                            let agent_count = match e.event_type {
                                EventType::Remove => 0,
                                _ => store.agent_count(&e.item).await.unwrap_or_else(|err| {
                                    warn!(configuration = %e.item.name, error = %err, "agent count failed");
                                    0
                                }),
                            };
                            out.push(ConfigurationChange {
                                configuration: e.item,
                                change_type: e.event_type,
                                agent_count,
                            });
                        }
                        if tx.send(Some(out)).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("configuration change feed stopped");
        });

        Ok((latest, unsubscribe))
    }

    pub fn agent_suggestions(&self, query: &str) -> Vec<Suggestion> {
        self.store.agent_index().suggestions(&Query::parse(query))
    }

    pub fn configuration_suggestions(&self, query: &str) -> Vec<Suggestion> {
        self.store.configuration_index().suggestions(&Query::parse(query))
    }

    // -----------------------------------------------------------------------
    // One-shot queries
    // -----------------------------------------------------------------------

    /// Per-agent graph for `ids`; an empty slice means every agent.
    pub async fn agent_metrics(&self, period: &str, ids: &[String]) -> Result<GraphMetrics> {
        let options = QueryOptions::with_period(self.period(period)?);
        self.agent_graph(options, ids).await
    }

    /// Pipeline graph for one configuration.
    ///
    /// # Errors
    /// [`Error::ConfigurationNotFound`] if `name` does not exist.
    pub async fn configuration_metrics(&self, period: &str, name: &str) -> Result<GraphMetrics> {
        let options = QueryOptions::with_period(self.period(period)?);
        self.configuration_graph(options, name).await
    }

    /// Fleet topology. See [`assemble_overview`] for selection semantics.
    pub async fn overview_metrics(
        &self,
        period: &str,
        configuration_ids: Option<&[String]>,
        destination_ids: Option<&[String]>,
    ) -> Result<GraphMetrics> {
        let options = QueryOptions::with_period(self.period(period)?);
        self.overview_graph(options, configuration_ids, destination_ids)
            .await
    }

    async fn agent_graph(&self, options: QueryOptions, ids: &[String]) -> Result<GraphMetrics> {
        let metrics = self.measurements.agent_metrics(ids, options).await?;
        Ok(assign_metrics_to_graph(&metrics, &AgentNodeIds))
    }

    async fn configuration_graph(&self, options: QueryOptions, name: &str) -> Result<GraphMetrics> {
        if self.store.configuration(name).await?.is_none() {
            return Err(Error::ConfigurationNotFound(name.to_string()));
        }
        let metrics = self.measurements.configuration_metrics(name, options).await?;
        Ok(assign_metrics_to_graph(&metrics, &ConfigurationNodeIds))
    }

    async fn overview_graph(
        &self,
        options: QueryOptions,
        configuration_ids: Option<&[String]>,
        destination_ids: Option<&[String]>,
    ) -> Result<GraphMetrics> {
        let metrics = self.measurements.overview_metrics(options).await?;
        let deployment = Deployment::resolve(self.store.as_ref(), &metrics).await;
        Ok(assemble_overview(
            &metrics,
            &deployment,
            configuration_ids,
            destination_ids,
        ))
    }

    // -----------------------------------------------------------------------
    // Polling subscriptions
    // -----------------------------------------------------------------------

    pub fn subscribe_agent_metrics(&self, period: &str, ids: Vec<String>) -> Result<MetricsSubscription> {
        let options = QueryOptions::with_period(self.period(period)?);
        let resolver = self.clone();
        let ids = Arc::new(ids);
        Ok(self.poll("agent", millis(self.cfg.agent_metrics_interval_ms), move || {
            let resolver = resolver.clone();
            let ids = Arc::clone(&ids);
            async move { resolver.agent_graph(options, &ids).await }
        }))
    }

    pub fn subscribe_configuration_metrics(&self, period: &str, name: &str) -> Result<MetricsSubscription> {
        let options = QueryOptions::with_period(self.period(period)?);
        let resolver = self.clone();
        let name: Arc<str> = Arc::from(name);
        Ok(self.poll(
            "configuration",
            millis(self.cfg.configuration_metrics_interval_ms),
            move || {
                let resolver = resolver.clone();
                let name = Arc::clone(&name);
                async move { resolver.configuration_graph(options, &name).await }
            },
        ))
    }

    pub fn subscribe_overview_metrics(
        &self,
        period: &str,
        configuration_ids: Option<Vec<String>>,
        destination_ids: Option<Vec<String>>,
    ) -> Result<MetricsSubscription> {
        let options = QueryOptions::with_period(self.period(period)?);
        let resolver = self.clone();
        let selection = Arc::new((configuration_ids, destination_ids));
        Ok(self.poll("overview", millis(self.cfg.overview_metrics_interval_ms), move || {
            let resolver = resolver.clone();
            let selection = Arc::clone(&selection);
            async move {
                let (cfgs, dests) = selection.as_ref();
                resolver
                    .overview_graph(options, cfgs.as_deref(), dests.as_deref())
                    .await
            }
        }))
    }

    /// Run `fetch` now and then every `every`, publishing each success.
    fn poll<F, Fut>(&self, kind: &'static str, every: Duration, fetch: F) -> MetricsSubscription
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<GraphMetrics>> + Send + 'static,
    {
        let cancel = self.cancel.child_token();
        let token = cancel.clone();
        let (tx, latest) = Latest::channel();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                match fetch().await {
                    Ok(graph) => {
                        consecutive_failures = 0;
                        if tx.send(Some(graph)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        if consecutive_failures >= FAILURE_ESCALATION {
                            error!(error = %e, kind, consecutive_failures, "metrics poll failed repeatedly, will retry next tick");
                        } else {
                            warn!(error = %e, kind, "metrics poll failed, will retry next tick");
                        }
                    }
                }
            }
            debug!(kind, "metrics poller stopped");
        });

        MetricsSubscription {
            latest,
            _guard: cancel.drop_guard(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
