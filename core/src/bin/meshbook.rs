//! Meshbook node binary: load configuration, start a node, run until
//! interrupted. Exit code 0 on clean shutdown, non-zero on startup
//! failure.

use clap::Parser;
use meshbook_core::{
    config::{Config, Environment},
    logging,
    node::Node,
};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "meshbook", about = "Peer-to-peer limit-order exchange node")]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, env = "MESHBOOK_CONFIG")]
    config: Option<PathBuf>,

    /// Deployment environment used for defaults when no config file is
    /// given.
    #[arg(long, value_enum, default_value = "development")]
    environment: Env,

    /// Override the P2P listener port.
    #[arg(long)]
    port: Option<u16>,

    /// Additional bootstrap peers, `host:port`. Repeatable.
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Override the trading pair, e.g. BTC/USD.
    #[arg(long)]
    pair: Option<String>,
}

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
enum Env {
    Development,
    Staging,
    Production,
    Test,
}

impl From<Env> for Environment {
    fn from(value: Env) -> Self {
        match value {
            Env::Development => Environment::Development,
            Env::Staging => Environment::Staging,
            Env::Production => Environment::Production,
            Env::Test => Environment::Test,
        }
    }
}

fn load_config(args: &Args) -> Result<Config, meshbook_core::NodeError> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::for_environment(args.environment.into()),
    };
    if let Some(port) = args.port {
        config.p2p.port = port;
    }
    if let Some(pair) = &args.pair {
        config.exchange.pair = pair.clone();
    }
    config.p2p.bootstrap_peers.extend(args.bootstrap.clone());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("meshbook: {error}");
            return ExitCode::FAILURE;
        }
    };

    if config.log.json {
        logging::init_json_logging();
    } else {
        logging::init_logging();
    }

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(error) => {
            error!(%error, "node construction failed");
            return ExitCode::FAILURE;
        }
    };
    let port = match node.start().await {
        Ok(port) => port,
        Err(error) => {
            error!(%error, "node startup failed");
            return ExitCode::FAILURE;
        }
    };
    info!(node = node.node_id(), port, "meshbook running, ctrl-c to stop");

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "signal handler failed");
    }
    node.shutdown().await;
    ExitCode::SUCCESS
}
