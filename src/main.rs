use std::fs::File;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::info;
use tokio::sync::mpsc;

mod backend;
mod codec;
mod config;
mod dispatcher;
mod messages;
mod registry;
mod scheduler;
mod session;
mod transport;

#[derive(Parser, Debug)]
#[command(about = "BLE gateway for UWB ranging/positioning nodes")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let mut file =
        File::open(&cli.config).with_context(|| format!("opening config {:?}", cli.config))?;
    let mut config_contents = String::new();
    file.read_to_string(&mut config_contents)?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)?;

    let registry = Arc::new(registry::FileRegistry::new(config.registry().path()));
    let backend = backend::HttpBackend::new(&config.backend).context("building backend client")?;

    let (telemetry_tx, telemetry_rx) = mpsc::channel(64);
    let dispatcher =
        dispatcher::TelemetryDispatcher::new(telemetry_rx, backend, config.dispatch_interval());
    tokio::spawn(dispatcher.run());

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let adapter = adapters
        .into_iter()
        .next()
        .context("no bluetooth adapter found")?;
    let central = transport::BtleCentral::new(adapter);

    info!("forwarding records to {}", config.backend.endpoint());
    let scheduler = scheduler::Scheduler::new(central, registry, telemetry_tx, &config);
    scheduler.run().await;

    Ok(())
}
