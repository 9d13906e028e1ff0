use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::measurements::{MeasurementBatcher, MemoryMeasurements};
use crate::model::{Agent, Configuration, Destination, GraphMetrics, MetricRecord};
use crate::resolver::Resolver;
use crate::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "fleetpulse")]
#[command(version)]
#[command(about = "Fleet change feeds and throughput graphs for a telemetry control plane")]
pub struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a JSON fixture and print the overview graph
    Overview {
        /// Fixture with agents, configurations, destinations and metrics
        #[arg(long)]
        fixture: PathBuf,

        /// Look-back period, e.g. 1m, 15m, 1h30m
        #[arg(long, default_value = "")]
        period: String,

        /// Configuration to show individually (repeatable)
        #[arg(long = "configuration")]
        configurations: Vec<String>,

        /// Destination to show individually (repeatable)
        #[arg(long = "destination")]
        destinations: Vec<String>,

        /// Roll up everything not explicitly selected
        #[arg(long)]
        rollup: bool,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Validate the configuration file and print the effective settings
    CheckConfig,
}

/// Resources and raw metrics to replay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub agents: Vec<Agent>,
    pub configurations: Vec<Configuration>,
    pub destinations: Vec<Destination>,
    pub metrics: Vec<MetricRecord>,
}

impl Fixture {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// No ids and no rollup means no selection at all.
pub fn selection(ids: Vec<String>, rollup: bool) -> Option<Vec<String>> {
    (rollup || !ids.is_empty()).then_some(ids)
}

/// Load `fixture` into in-memory stores, push its metrics through the
/// batcher, and query the overview.
pub async fn replay_overview(
    cfg: &Config,
    fixture: Fixture,
    period: &str,
    configuration_ids: Option<&[String]>,
    destination_ids: Option<&[String]>,
) -> Result<GraphMetrics> {
    let store = Arc::new(MemoryStore::new(cfg.bus.clone()));
    for agent in fixture.agents {
        store.upsert_agent(agent).await;
    }
    for configuration in fixture.configurations {
        store.upsert_configuration(configuration).await;
    }
    for destination in fixture.destinations {
        store.upsert_destination(destination).await;
    }

    let measurements = Arc::new(MemoryMeasurements::new());
    let batcher = MeasurementBatcher::new(measurements.clone(), cfg.batcher.clone());
    let ctx = CancellationToken::new();
    let n = fixture.metrics.len();
    batcher.accept_metrics(&ctx, fixture.metrics).await?;
    batcher.shutdown(&ctx).await?;
    info!(metrics = n, "fixture replayed");

    let resolver = Resolver::with_bus_config(
        store,
        measurements,
        cfg.resolver.clone(),
        cfg.bus.clone(),
    );
    let graph = resolver
        .overview_metrics(period, configuration_ids, destination_ids)
        .await;
    resolver.close();
    graph
}
