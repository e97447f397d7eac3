//! nlamon: subscribe to the master's merged stream
//!
//! Logs every envelope and keeps a last-writer-wins table of the cluster
//! state; prints the table size when the stream ends.
//!
//! # Usage
//!
//! ```bash
//! nlamon --api 10.0.0.1:50062
//! nlamon --api 10.0.0.1:50062 --node 3 --group link --group route
//! ```

use anyhow::Context;
use clap::Parser;
use nla_msg::{Group, NodeId, StateTable};
use nlad::api::{SubscribeFilter, SubscriberClient};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "nlamon")]
#[command(about = "Monitor the cluster netlink stream", long_about = None)]
struct Args {
    /// Master subscriber address
    #[arg(short = 'a', long, default_value = "127.0.0.1:50062")]
    api: String,

    /// Only envelopes from this node
    #[arg(long)]
    node: Option<u8>,

    /// Only these kinds (link, addr, neigh, route, node, vpn, bridge)
    #[arg(short = 'g', long = "group")]
    groups: Vec<String>,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn parse_group(name: &str) -> anyhow::Result<Group> {
    serde_json::from_value(serde_json::Value::String(name.to_lowercase()))
        .with_context(|| format!("unknown group {}", name))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let filter = SubscribeFilter {
        nid: args.node.map(NodeId),
        groups: args
            .groups
            .iter()
            .map(|g| parse_group(g))
            .collect::<anyhow::Result<Vec<_>>>()?,
    };

    let mut client = SubscriberClient::connect(&args.api, NodeId::ALL, filter)
        .await
        .with_context(|| format!("connecting to {}", args.api))?;
    info!(api = %args.api, master_nid = %client.master_nid(), "Subscribed");

    let mut table = StateTable::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = client.recv() => match received? {
                Some(envelope) => {
                    info!("{}", envelope);
                    table.apply(&envelope);
                }
                None => {
                    info!("Stream closed by master");
                    break;
                }
            }
        }
    }

    println!(
        "entries: {} stale: {}",
        table.len(),
        table.stale_count()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("nlamon: failed to set logger");
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("nlamon: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
