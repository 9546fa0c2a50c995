use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lorawan_ns::app::LogApplication;
use lorawan_ns::config::Config;
use lorawan_ns::mac::commands::NullMacHandler;
use lorawan_ns::mac::{EngineConfig, MacEngine};
use lorawan_ns::store::SessionStore;
use lorawan_ns::udp;

#[derive(Parser)]
#[command(name = "lorawan-ns")]
#[command(about = "LoRaWAN 1.0.1 Class-A network server MAC engine")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lorawan-ns v{}", env!("CARGO_PKG_VERSION"));

    // Seed the session store from the provisioning tables
    let store = Arc::new(SessionStore::new());
    config.provisioning.seed(&store)?;
    info!(
        "provisioned {} gateway(s), {} device(s)",
        config.provisioning.gateways.len(),
        config.provisioning.devices.len()
    );

    let engine = Arc::new(MacEngine::new(
        store,
        LogApplication,
        NullMacHandler,
        EngineConfig { preprocessing_delay_ms: config.lorawan.preprocessing_delay },
    ));

    info!("Starting Semtech UDP Packet Forwarder server...");
    udp::run_server(&config, engine).await?;

    Ok(())
}
