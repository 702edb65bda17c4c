use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use smartcity_gateway::{config, Gateway};
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(
    name = "smartcity-gateway",
    version,
    about = "Smart city gateway - device discovery, registry and command relay",
    long_about = "Smart City Gateway\n\n\
        Announces itself on a multicast group, accepts device registrations\n\
        and client requests over TCP, and ingests sensor telemetry over UDP.\n\n\
        Examples:\n  \
          # Run with defaults (TCP 10000, UDP 10001, group 224.1.1.1:5007)\n  \
          smartcity-gateway\n\n  \
          # Custom ports, no beacon\n  \
          smartcity-gateway --tcp-port 11000 --udp-port 11001 --no-discovery"
)]
struct Args {
    /// Path to config file (TOML)
    #[arg(long, short = 'C')]
    config: Option<PathBuf>,

    /// TCP port for device and client sessions
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP port for sensor telemetry
    #[arg(long)]
    udp_port: Option<u16>,

    /// Seconds between discovery beacons
    #[arg(long)]
    discovery_interval: Option<u64>,

    /// Disable the multicast discovery beacon
    #[arg(long)]
    no_discovery: bool,

    /// Port for the Prometheus metrics endpoint
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable the metrics endpoint
    #[arg(long)]
    no_metrics: bool,
}

/// Load the config, deferring the fallback warning until logging is up.
fn load_config(args: &Args) -> (config::Config, Option<String>) {
    match &args.config {
        Some(path) => match config::Config::load(path) {
            Ok(config) => (config, None),
            Err(e) => (
                config::Config::default(),
                Some(format!(
                    "Failed to load config from {:?}: {:#}. Using defaults.",
                    path, e
                )),
            ),
        },
        None => (config::Config::load_or_default(), None),
    }
}

fn apply_overrides(args: &Args, config: &mut config::Config) {
    if let Some(port) = args.tcp_port {
        config.gateway.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.gateway.udp_port = port;
    }
    if let Some(secs) = args.discovery_interval {
        config.discovery.interval_secs = secs;
    }
    if args.no_discovery {
        config.discovery.enabled = false;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.port = port;
    }
    if args.no_metrics {
        config.metrics.enabled = false;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, load_error) = load_config(&args);
    apply_overrides(&args, &mut config);

    // RUST_LOG wins over the config file's level
    let env = Env::default().default_filter_or(config.gateway.log_level.as_str());
    env_logger::Builder::from_env(env).init();
    if let Some(message) = load_error {
        warn!("{}", message);
    }

    let gateway = Gateway::bind(config).await?;
    info!(
        "Gateway sessions on TCP/{}, telemetry on UDP/{}",
        gateway.tcp_addr()?.port(),
        gateway.udp_addr()?.port()
    );

    tokio::select! {
        result = gateway.run() => result,
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    }
}
