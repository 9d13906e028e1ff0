use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleetpulse::cli::{replay_overview, selection, Args, Command, Fixture};
use fleetpulse::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match args.command {
        Command::Overview {
            fixture,
            period,
            configurations,
            destinations,
            rollup,
            pretty,
        } => {
            let fixture = Fixture::load(&fixture)?;
            let configurations = selection(configurations, rollup);
            let destinations = selection(destinations, rollup);
            let graph = replay_overview(
                &cfg,
                fixture,
                &period,
                configurations.as_deref(),
                destinations.as_deref(),
            )
            .await?;
            let json = if pretty {
                serde_json::to_string_pretty(&graph)?
            } else {
                serde_json::to_string(&graph)?
            };
            println!("{json}");
        }
        Command::CheckConfig => {
            println!("{cfg:#?}");
        }
    }

    Ok(())
}
