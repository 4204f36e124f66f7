//! Operator driver for the WAN relay.
//!
//! Runs one site in either role from a JSON config file. The server role
//! logs every received payload and blocks until ENTER is pressed; the
//! sender role relays stdin lines as payloads and reports ack progress
//! through the predicate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use wan_agent::{PredicateFn, RemoteMessageCallback, WanAgentSender, WanAgentServer, WanConfig};

#[derive(Parser)]
#[command(name = "wan-agent", version, about = "WAN relay site driver")]
struct Args {
    /// Path to the WAN group config (JSON, WAN_AGENT_* keys)
    #[arg(short, long)]
    config: PathBuf,

    /// Which role this process plays
    #[arg(short, long, value_enum)]
    role: Role,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Role {
    Sender,
    Server,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wan_agent=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = WanConfig::from_file(&args.config)?;
    info!(
        "wan-agent {} starting as {:?}, site {} at {}",
        wan_agent::VERSION,
        args.role,
        config.local_site_id,
        config.local_endpoint()
    );

    match args.role {
        Role::Server => run_server(&config).await,
        Role::Sender => run_sender(&config).await,
    }
}

async fn run_server(config: &WanConfig) -> Result<(), Box<dyn std::error::Error>> {
    let rmc: RemoteMessageCallback = Arc::new(|site_id: u32, payload: &[u8]| {
        info!("received {} bytes from site {}", payload.len(), site_id);
    });
    let mut server = WanAgentServer::new(config, rmc)?;
    info!("server up on {}; press ENTER to shut down", server.local_addr());

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;

    server.shutdown_and_wait().await?;
    info!("server shut down");
    Ok(())
}

async fn run_sender(config: &WanConfig) -> Result<(), Box<dyn std::error::Error>> {
    let predicate: PredicateFn = Arc::new(|counters: &HashMap<u32, u64>| {
        let mut acked: Vec<_> = counters.iter().collect();
        acked.sort();
        info!("ack vector advanced: {:?}", acked);
    });
    let mut sender = WanAgentSender::new(config, predicate).await?;

    if !sender.wait_ready().await {
        sender.shutdown_and_wait().await?;
        return Err("sender failed before becoming ready".into());
    }
    info!("sender ready; each stdin line is relayed as one payload, EOF shuts down");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        sender.enqueue(line.as_bytes())?;
    }

    let stats = sender.stats();
    info!(
        "shutting down with {} pending, frontier at {}",
        stats.pending, stats.last_all_sent
    );
    sender.shutdown_and_wait().await?;
    Ok(())
}
