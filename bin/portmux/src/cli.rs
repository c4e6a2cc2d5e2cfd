//! Command line interface.

use clap::{Args, Parser, Subcommand};
use libp2p::Multiaddr;

/// Peer-to-peer port forwarding over libp2p.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub node: NodeArgs,

    #[command(flatten)]
    pub logs: LogArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Host configuration.
#[derive(Debug, Args)]
pub struct NodeArgs {
    /// TCP port for incoming overlay connections (0 = ephemeral).
    #[arg(long, default_value_t = 0)]
    pub listen_port: u16,

    /// Bootstrap peer multiaddrs; peers with a /p2p/ component also
    /// serve as relay candidates for circuit fallback.
    #[arg(long = "bootstrap", value_name = "MULTIADDR")]
    pub bootstrap: Vec<Multiaddr>,
}

/// Logging configuration.
#[derive(Debug, Args)]
pub struct LogArgs {
    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Extra tracing filter directives, appended to the level.
    #[arg(long, value_name = "FILTER")]
    pub filter: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Expose an overlay protocol, delivering its streams to a local
    /// TCP address.
    Listen {
        /// Stream protocol name, e.g. /x/ssh.
        protocol: String,
        /// Local TCP target multiaddr, e.g. /ip4/127.0.0.1/tcp/22.
        target: String,
    },

    /// Forward a local TCP port to a protocol on a remote peer.
    Forward {
        /// Stream protocol name, e.g. /x/ssh.
        protocol: String,
        /// Local port to listen on (0 = ephemeral).
        port: u16,
        /// Remote peer id.
        peer: String,
    },

    /// Forward a random high port to /x/ssh on a remote peer.
    Ssh {
        /// Remote peer id.
        peer: String,
    },
}
