use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use inverter_bridge::arbiter::{ArbiterConfig, SerialArbiter};
use inverter_bridge::cache::FallbackCache;
use inverter_bridge::config::Config;
use inverter_bridge::coordinator::BridgeCoordinator;
use inverter_bridge::guard::OperationGuardRegistry;
use inverter_bridge::listener::TcpFrontend;

/// Network-to-serial bridge exposing an RS-485 battery inverter as a TCP
/// service speaking the vendor dongle's wire protocol.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to a TOML configuration file. Missing fields fall back to spec
    /// defaults; a missing file falls back entirely to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial device the inverter is attached to.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    serial_port: String,

    /// Serial baud rate. The inverter protocol runs at 19200 8N1.
    #[arg(long, default_value_t = 19200)]
    baud_rate: u32,

    /// Overrides `tcp_port` from the config file, if set.
    #[arg(long)]
    tcp_port: Option<u16>,
}

fn serial_field(s: &str) -> [u8; 10] {
    let bytes = s.as_bytes();
    let mut out = [0u8; 10];
    let n = bytes.len().min(10);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Config::from_toml_str(&text)?
        }
        None => Config::default(),
    };
    if let Some(port) = cli.tcp_port {
        config.tcp_port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!(target: "inverter_bridge", serial_port = %cli.serial_port, baud_rate = cli.baud_rate, "opening inverter serial port");
    let port = tokio_serial::new(&cli.serial_port, cli.baud_rate).open_native_async()?;

    let arbiter_config = ArbiterConfig {
        response_timeout: config.response_timeout(),
        inter_frame_gap: config.inter_frame_gap(),
        probe_backoff_base: config.probe_backoff_base(),
        probe_backoff_max: config.probe_backoff_max(),
    };
    let arbiter = SerialArbiter::spawn(port, None, arbiter_config);

    let guard = OperationGuardRegistry::new();
    let cache = FallbackCache::new(config.cache_max_entries, config.cache_ttl());
    let dongle_serial = serial_field(&config.dongle_serial);
    let coordinator = Arc::new(Mutex::new(BridgeCoordinator::new(arbiter, guard, cache, dongle_serial, config.request_timeout())));

    let ticker_coordinator = coordinator.clone();
    let ticker = tokio::spawn(async move {
        loop {
            ticker_coordinator.lock().await.tick();
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
    });

    let frontend = TcpFrontend::new(coordinator, config.max_clients, config.client_idle_timeout());
    let bind_addr: SocketAddr = ([0, 0, 0, 0], config.tcp_port).into();

    tokio::select! {
        result = frontend.run(bind_addr) => {
            if let Err(e) = result {
                error!(target: "inverter_bridge", error = %e, "listener stopped with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(target: "inverter_bridge", "received shutdown signal");
        }
    }

    ticker.abort();
    Ok(())
}
