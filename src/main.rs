//! nodemux - local forward proxy over health-checked upstream nodes

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nodemux::config::Config;
use nodemux::error::{Error, Result};
use nodemux::Runtime;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "nodemux")]
#[command(about = "Local forward proxy multiplexing connections over upstream nodes")]
#[command(version)]
struct Args {
    /// Path to the JSON options file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    gen_config: bool,

    /// Control API listen address (e.g. 127.0.0.1:8123), overrides the config
    #[arg(long)]
    api: Option<String>,

    /// Local proxy port, overrides the config
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::default())
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        println!("{}", json);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.local_port = port;
    }
    if args.api.is_some() {
        config.api_listen = args.api;
    }

    // RUST_LOG wins over the config file
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    match &args.config {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file specified, using defaults"),
    }
    info!("nodemux v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}
