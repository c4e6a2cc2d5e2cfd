use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, kad, noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use portmux_addr::{extract_peer_id, split_peer_addr};
use portmux_api::OverlayError;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::behaviour::{NodeBehaviour, NodeBehaviourEvent};
use crate::OverlayHandle;

const IDENTIFY_PROTOCOL: &str = "/portmux/1.0.0";

/// Errors from building and starting the host.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to build swarm: {0}")]
    Swarm(String),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: Multiaddr,
        source: libp2p::TransportError<std::io::Error>,
    },
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TCP port for incoming connections; 0 for an ephemeral port.
    pub listen_port: u16,
    /// Peers dialed at startup, in random order.
    pub bootstrap: Vec<Multiaddr>,
    /// How long idle connections are kept open.
    pub idle_connection_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            bootstrap: Vec::new(),
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: Vec<Multiaddr>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = timeout;
        self
    }
}

pub(crate) enum NodeCommand {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    AddAddresses {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The swarm event loop.
///
/// Owned by a background task; everything else talks to it through an
/// [`OverlayHandle`].
pub struct Node {
    swarm: Swarm<NodeBehaviour>,
    command_rx: mpsc::UnboundedReceiver<NodeCommand>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), OverlayError>>>>,
}

impl Node {
    /// Build the swarm, start listening, dial the bootstrap peers, and
    /// run the event loop on a background task.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(config: NodeConfig) -> Result<OverlayHandle, NodeError> {
        let mut swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NodeError::Swarm(e.to_string()))?
            .with_dns()
            .map_err(|e| NodeError::Swarm(e.to_string()))?
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| NodeError::Swarm(e.to_string()))?
            .with_behaviour(|keypair, relay| {
                let peer_id = keypair.public().to_peer_id();
                NodeBehaviour {
                    stream: libp2p_stream::Behaviour::new(),
                    identify: identify::Behaviour::new(identify::Config::new(
                        IDENTIFY_PROTOCOL.to_owned(),
                        keypair.public(),
                    )),
                    ping: libp2p::ping::Behaviour::default(),
                    kad: kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id)),
                    relay,
                }
            })
            .map_err(|e| NodeError::Swarm(e.to_string()))?
            .with_swarm_config(|cfg| {
                cfg.with_idle_connection_timeout(config.idle_connection_timeout)
            })
            .build();

        let listen_addr = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(config.listen_port));
        swarm
            .listen_on(listen_addr.clone())
            .map_err(|source| NodeError::Listen {
                addr: listen_addr,
                source,
            })?;

        let peer_id = *swarm.local_peer_id();
        info!(%peer_id, "host starting");

        // seed the routing table before dialing out
        let mut bootstrap = config.bootstrap;
        bootstrap.shuffle(&mut rand::rng());
        for addr in &bootstrap {
            if let Some(info) = split_peer_addr(addr) {
                for a in info.addrs {
                    swarm.behaviour_mut().kad.add_address(&info.peer_id, a);
                }
            }
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!(%addr, error = %e, "bootstrap dial failed");
            }
        }
        if !bootstrap.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kad.bootstrap() {
                warn!(error = %e, "kademlia bootstrap failed");
            }
        }

        let control = swarm.behaviour().stream.new_control();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let node = Node {
            swarm,
            command_rx,
            pending_dials: HashMap::new(),
        };
        tokio::spawn(node.run());

        Ok(OverlayHandle::new(peer_id, control, command_tx))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        info!("host event loop stopped");
    }

    /// Returns true when the loop should shut down.
    fn handle_command(&mut self, command: NodeCommand) -> bool {
        match command {
            NodeCommand::Dial { addr, reply } => {
                let target = extract_peer_id(&addr);
                if let Some(peer) = target {
                    if self.swarm.is_connected(&peer) {
                        let _ = reply.send(Ok(()));
                        return false;
                    }
                }
                match self.swarm.dial(addr) {
                    Ok(()) => match target {
                        // completion is reported once the connection
                        // attempt to the peer settles
                        Some(peer) => {
                            self.pending_dials.entry(peer).or_default().push(reply);
                        }
                        None => {
                            let _ = reply.send(Ok(()));
                        }
                    },
                    Err(e) => {
                        let _ = reply.send(Err(OverlayError::Dial(e.to_string())));
                    }
                }
            }
            NodeCommand::AddAddresses { peer, addrs } => {
                for addr in addrs {
                    self.swarm.add_peer_address(peer, addr.clone());
                    self.swarm.behaviour_mut().kad.add_address(&peer, addr);
                }
            }
            NodeCommand::Shutdown { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } => {
                debug!(%peer_id, num_established, "connection established");
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for reply in waiters {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                debug!(%peer_id, num_established, cause = ?cause, "connection closed");
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    warn!(%peer_id, %error, "outgoing connection error");
                    if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                        let message = error.to_string();
                        for reply in waiters {
                            let _ = reply.send(Err(OverlayError::Dial(message.clone())));
                        }
                    }
                } else {
                    warn!(%error, "outgoing connection error (unknown peer)");
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(%peer_id, agent = %info.agent_version, "identified peer");
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
            }
            NodeBehaviourEvent::Identify(_) => {}
            NodeBehaviourEvent::Ping(_) => {}
            NodeBehaviourEvent::Kad(event) => {
                trace!(?event, "kademlia event");
            }
            NodeBehaviourEvent::Relay(event) => {
                debug!(?event, "relay client event");
            }
            NodeBehaviourEvent::Stream(_) => {}
        }
    }
}
