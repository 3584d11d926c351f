//! Main entry point for the binary daemon
use anyhow::Result;
use clap::Parser;
use mncon::config::Settings;
use mncon::Connector;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, prelude::*};

/// MongoDB-NATS Connector Daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the connector config file (YAML)
    #[arg(short, long, env = "CONFIG_FILE", default_value = "connector.yaml")]
    config: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(LevelFilter::from_level(settings.log_level.as_tracing()))
        .init();

    let connector = Connector::new(settings).await?;
    match connector.run().await {
        Ok(()) => Ok(()),
        // The health server's close sentinel marks an orderly shutdown.
        Err(e) if e.is_server_closed() => {
            info!("connector shut down cleanly");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
