use libp2p::{Multiaddr, PeerId};
use portmux_addr::AddrError;
use portmux_api::OverlayError;

/// Errors from establishing or probing forwards.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Binding the local listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: Multiaddr,
        source: std::io::Error,
    },

    /// The listen or target address is not a plain TCP/IP multiaddr.
    #[error("unsupported address {0}, expected ip4/ip6 + tcp")]
    UnsupportedAddress(Multiaddr),

    /// The overlay refused a stream operation.
    #[error("stream error: {0}")]
    Stream(#[from] OverlayError),

    /// The health probe could not reach the peer.
    #[error("peer {peer} is unreachable: {source}")]
    Unreachable { peer: PeerId, source: OverlayError },

    /// Circuit fallback was required but no relay candidates exist.
    #[error("no relay available for circuit fallback")]
    NoRelayAvailable,

    /// Dialing the two-hop circuit through the chosen relay failed.
    #[error("circuit via relay {relay} failed: {source}")]
    CircuitFailed { relay: PeerId, source: OverlayError },

    #[error(transparent)]
    Addr(#[from] AddrError),
}
