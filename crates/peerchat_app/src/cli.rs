use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use peerchat_network::NetworkConfig;

#[derive(Parser, Debug)]
#[command(name = "peerchat")]
#[command(about = "Serverless peer-to-peer chat", version)]
pub struct Cli {
    /// Path to the JSON config file (default ~/.peerchat/config.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the identity file (default ~/.peerchat/identity.json)
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Address to accept connections on, e.g. 0.0.0.0:9470
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Node name used when a new identity is generated
    #[arg(long)]
    pub name: Option<String>,

    /// Seed peer for routed discovery, as <peer-id>@<ip>:<port>. Repeatable.
    #[arg(long = "seed")]
    pub seeds: Vec<String>,

    /// Disable LAN discovery
    #[arg(long)]
    pub no_local_discovery: bool,

    /// UDP port for LAN discovery announcements
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// Exit if the routed discovery bootstrap fails
    #[arg(long)]
    pub require_routed: bool,

    /// Connection timeout in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,
}

impl Cli {
    /// Overlay command-line flags on top of a loaded config.
    pub fn apply(&self, config: &mut NetworkConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(name) = &self.name {
            config.node_name = name.clone();
        }
        if !self.seeds.is_empty() {
            config.seed_peers = self.seeds.clone();
        }
        if self.no_local_discovery {
            config.discovery_enabled = false;
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
        if self.require_routed {
            config.require_routed_discovery = true;
        }
        if let Some(secs) = self.connect_timeout {
            config.connection_timeout = Duration::from_secs(secs);
        }
    }
}
