//! libp2p host for portmux.
//!
//! [`Node::spawn`] builds a swarm (tcp + noise + yamux, dns, relay
//! client transport; stream, identify, ping, kademlia behaviours),
//! runs its event loop on a background task, and hands back an
//! [`OverlayHandle`] implementing the overlay interface the forwarding
//! layers consume. Construction is explicit; nothing starts until the
//! caller asks for it.

mod behaviour;
mod dns;
mod node;
mod overlay;

pub use dns::{resolve_dnsaddr, DnsResolveError};
pub use node::{Node, NodeConfig, NodeError};
pub use overlay::{OverlayHandle, DIAL_TIMEOUT};
