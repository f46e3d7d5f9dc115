mod cli;
mod logging;
mod paths;
mod repl;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};

use peerchat_network::{ChatNode, NetworkConfig, NodeIdentity};

use crate::cli::Cli;
use crate::repl::Repl;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match logging::init_logging() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Logging disabled: {e:#}");
            None
        }
    };
    info!("Starting peerchat v{VERSION}");

    match run(cli).await {
        Ok(()) => {
            info!("peerchat exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {e:#}");
            eprintln!("peerchat: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => paths::config_path()?,
    };
    let mut config = NetworkConfig::load_or_default(&config_path);
    cli.apply(&mut config);

    let identity_path = match &cli.identity {
        Some(path) => path.clone(),
        None => paths::identity_path()?,
    };
    let identity = NodeIdentity::load_or_generate(&identity_path, config.node_name.clone());
    info!(
        "Identity {} ({}) from {}",
        identity.peer_id,
        identity.name,
        identity_path.display()
    );

    let mut node = ChatNode::new(identity, config);
    let inbox = node.take_inbox().context("Chat inbox already taken")?;
    node.start().await.context("Failed to start chat node")?;
    let handle = node.handle().context("Chat node not running")?;

    let mut repl = Repl::new(handle, tokio::io::stdout());
    let input = BufReader::new(tokio::io::stdin());
    let outcome = tokio::select! {
        result = repl.run(input, inbox) => result.context("Console I/O failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    node.stop().await;
    outcome
}
