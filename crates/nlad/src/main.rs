//! Cluster netlink state agent
//!
//! Main entry point for the nlad daemon. The role is fixed at startup: nid 0
//! without a master address runs the master, any other nid dials the master.

use anyhow::Context;
use clap::Parser;
use nlad::config::DEFAULT_CONFIG_PATH;
use nlad::{Daemon, NladConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Cluster netlink state agent
#[derive(Parser, Debug)]
#[command(name = "nlad")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Node id (0 = master)
    #[arg(short = 'n', long)]
    nid: Option<u8>,

    /// Master core address; makes this node a slave
    #[arg(short = 'm', long)]
    master: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<NladConfig> {
        let mut config = NladConfig::load_or_default(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        if let Some(nid) = self.nid {
            config.node.nid = nid;
        }
        if let Some(master) = &self.master {
            config.nla.master = Some(master.clone());
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        Ok(config)
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("setting logger")?;
    Ok(())
}

fn setup_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("nlad: Received SIGINT");
            shutdown.cancel();
        }
    });
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.load_config()?;
    init_logging(&config.log.level)?;

    let daemon = Daemon::new(config).context("invalid configuration")?;
    setup_signal_handler(daemon.shutdown_token());
    daemon.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("nlad: exiting with error: {:#}", e);
            eprintln!("nlad: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
