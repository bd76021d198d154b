//! encounterd - combat encounter daemon

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use encounterd::config::{LogFormat, Overrides};
use encounterd::{Config, Server};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// D&D 5e combat encounter server
#[derive(Parser, Debug)]
#[command(name = "encounterd", version, about = "Run the combat encounter server")]
struct Args {
    /// TOML config file (defaults to ./encounterd.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Seed for encounters created without one
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config from defaults, file, environment and flags
    let config = Config::load(
        args.config.as_deref(),
        Overrides {
            bind_addr: args.bind,
            default_seed: args.seed,
        },
    )?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_filter.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    // Create and run server
    let server = Arc::new(Server::new(config));
    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_server.shutdown();
        }
    });

    server.run().await?;

    Ok(())
}
