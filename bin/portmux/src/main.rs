//! portmux - peer-to-peer port forwarding over libp2p.

mod cli;
mod logging;

use std::sync::Arc;

use clap::Parser;
use eyre::Result;
use portmux_addr::{multiaddr_to_socketaddr, split_peer_addr};
use portmux_client::P2pClient;
use portmux_node::{Node, NodeConfig};
use tracing::info;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.logs)?;

    let config = NodeConfig::default()
        .with_listen_port(cli.node.listen_port)
        .with_bootstrap(cli.node.bootstrap.clone());
    let handle = Node::spawn(config)?;

    let relays = cli
        .node
        .bootstrap
        .iter()
        .filter_map(split_peer_addr)
        .collect();
    let client = P2pClient::new(Arc::new(handle), relays);
    info!(peer_id = %client.local_peer_id(), "portmux ready");

    match cli.command {
        Command::Listen { protocol, target } => {
            let forward = client.listen(&protocol, &target).await?;
            info!(%forward, "listening on the overlay");
        }
        Command::Forward { protocol, port, peer } => {
            let forward = client.forward(&protocol, port, &peer).await?;
            info!(%forward, "forward established");
        }
        Command::Ssh { peer } => {
            let forward = client.forward_with_random_port(&peer).await?;
            info!(%forward, "forward established");
            if let Some(socket) = multiaddr_to_socketaddr(&forward.listen_address) {
                println!("{socket}");
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    client.destroy().await?;
    Ok(())
}
