//! DoIP gateway daemon.
//!
//! Bridges DoIP testers on TCP to an ECU on a CAN interface.
//!
//! # Usage
//!
//! ```bash
//! doip-gateway --interface can0
//! doip-gateway --config gateway.toml --listen 0.0.0.0:13400
//! RUST_LOG=doip_gateway=debug doip-gateway --interface vcan0
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use doip_gateway::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "doip-gateway")]
#[command(about = "DoIP to ISO-TP/CAN diagnostic gateway")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CAN interface name
    #[arg(short, long)]
    interface: Option<String>,

    /// TCP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// CAN identifier for requests to the ECU (e.g. 0x7E0)
    #[arg(long, value_parser = parse_can_id)]
    request_id: Option<u16>,

    /// CAN identifier of ECU responses (e.g. 0x7E8)
    #[arg(long, value_parser = parse_can_id)]
    response_id: Option<u16>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn parse_can_id(s: &str) -> std::result::Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid CAN id '{s}': {e}"))
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    if let Some(interface) = &args.interface {
        config = config.with_interface(interface.clone());
    }
    if let Some(listen) = args.listen {
        config = config.with_listen_addr(listen);
    }
    if args.request_id.is_some() || args.response_id.is_some() {
        let request_id = args.request_id.unwrap_or(config.can.request_id);
        let response_id = args.response_id.unwrap_or(config.can.response_id);
        config = config.with_can_ids(request_id, response_id);
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn run(config: GatewayConfig) -> Result<()> {
    use std::sync::Arc;
    use doip_gateway::transport::SocketCanBus;

    let gateway = Gateway::bind(config, |config: &GatewayConfig| {
        SocketCanBus::open(&config.can).map(Arc::new)
    })
    .context("failed to start gateway")?;
    gateway.run()?;
    Ok(())
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn run(_config: GatewayConfig) -> Result<()> {
    anyhow::bail!("no CAN backend: build on Linux with the `socketcan` feature")
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("doip_gateway=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting doip-gateway");
    run(config)
}
