//! DoIP tester demo.
//!
//! Activates routing on a running gateway, sends one UDS request and prints
//! every response until the read times out.
//!
//! ```bash
//! cargo run --example doip_client -- --gateway 127.0.0.1:13400 22F190
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use doip_gateway::transport::DoipClient;
use doip_gateway::{GatewayError, LogicalAddress};

#[derive(Parser, Debug)]
#[command(name = "doip_client")]
#[command(about = "Send one UDS request through a DoIP gateway")]
struct Args {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:13400")]
    gateway: SocketAddr,

    /// Tester logical address
    #[arg(long, default_value_t = 0x0E00)]
    tester: u16,

    /// ECU logical address
    #[arg(long, default_value_t = 0x1000)]
    ecu: u16,

    /// Seconds to wait for further responses
    #[arg(long, default_value_t = 2)]
    wait: u64,

    /// UDS request as hex (e.g. 22F190)
    request: String,
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    anyhow::ensure!(
        !s.is_empty() && s.len() % 2 == 0,
        "hex request needs an even number of digits"
    );
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).with_context(|| format!("bad hex '{}'", &s[i..i + 2])))
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("doip_gateway=info")
        .init();

    let args = Args::parse();
    let request = parse_hex(&args.request)?;

    let mut client = DoipClient::connect(args.gateway, LogicalAddress(args.tester))
        .with_context(|| format!("failed to connect to {}", args.gateway))?;
    client.set_read_timeout(Some(Duration::from_secs(args.wait)))?;

    let code = client.activate_routing(0x00)?;
    println!("Routing activation: {code:?}");
    anyhow::ensure!(code.is_success(), "routing activation denied");

    println!("Request:  {request:02X?}");
    client.send_diagnostic(LogicalAddress(args.ecu), &request)?;

    loop {
        match client.receive_diagnostic() {
            Ok(response) => {
                println!(
                    "Response: {:02X?} ({} -> {})",
                    response.user_data.as_ref(),
                    response.source,
                    response.target
                );
            }
            Err(GatewayError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    client.close()?;
    Ok(())
}
