use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, kad, ping, relay};

/// Combined behaviour for the portmux host.
///
/// `stream` carries the forwarded byte streams; `kad` gives the host a
/// routed view of the network so bare `/p2p/<id>` targets can be
/// reached; `relay` enables dialing through `/p2p-circuit` addresses.
#[derive(NetworkBehaviour)]
pub(crate) struct NodeBehaviour {
    pub(crate) stream: libp2p_stream::Behaviour,
    pub(crate) identify: identify::Behaviour,
    pub(crate) ping: ping::Behaviour,
    pub(crate) kad: kad::Behaviour<kad::store::MemoryStore>,
    pub(crate) relay: relay::client::Behaviour,
}
