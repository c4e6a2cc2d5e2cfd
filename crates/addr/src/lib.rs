//! Peer addressing for portmux.
//!
//! - [`AddrInfo`] - a peer identity plus its known dialable addresses
//! - Literal `/p2p/` address splitting and symbolic (dnsaddr-style)
//!   resolution via the overlay collaborator
//! - Relay circuit address construction

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use portmux_api::{OverlayError, OverlayNetwork};
use tracing::debug;

/// Bound on symbolic address resolution.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from address parsing and resolution.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    /// The address string is not a valid multiaddr.
    #[error("invalid multiaddr: {0}")]
    Parse(#[from] libp2p::multiaddr::Error),

    /// Resolution produced no usable address records.
    #[error("failed to resolve {0}: no address records with a peer identity")]
    ResolutionFailed(Multiaddr),

    /// Resolution produced records naming two distinct peer identities.
    #[error("ambiguous multiaddr {addr} could refer to {first} or {second}")]
    Ambiguous {
        addr: Multiaddr,
        first: PeerId,
        second: PeerId,
    },

    /// The overlay collaborator failed the resolution call.
    #[error(transparent)]
    Overlay(#[from] OverlayError),
}

/// A peer identity and the addresses at which it may be dialed.
///
/// The address set may be empty for peers known only by identity
/// (e.g. a bare `/p2p/<id>` target reached via the routing layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// A peer known only by identity, with no dialable addresses.
    pub fn from_peer_id(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
        }
    }
}

impl std::fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}: {:?}}}", self.peer_id, self.addrs)
    }
}

/// Resolve an address string to a single peer and its addresses.
///
/// A literal address ending in `/p2p/<id>` is split directly. Anything
/// else is treated as symbolic and resolved through the collaborator
/// within [`RESOLVE_TIMEOUT`]; all records are merged under the single
/// peer identity found. Zero usable records fail with
/// [`AddrError::ResolutionFailed`]; records naming two distinct peers
/// fail with [`AddrError::Ambiguous`], reporting both candidates.
pub async fn resolve<N: OverlayNetwork>(net: &N, address: &str) -> Result<AddrInfo, AddrError> {
    let addr: Multiaddr = address.parse()?;

    if let Some(info) = split_peer_addr(&addr) {
        return Ok(info);
    }

    let records = net.resolve_symbolic(&addr, RESOLVE_TIMEOUT).await?;
    if records.is_empty() {
        return Err(AddrError::ResolutionFailed(addr));
    }

    let mut found: Option<AddrInfo> = None;
    for record in records {
        let Some(split) = split_peer_addr(&record) else {
            // not a peer address record, skipping
            debug!(addr = %record, "resolved record has no peer component");
            continue;
        };
        match &mut found {
            None => found = Some(split),
            Some(info) if info.peer_id == split.peer_id => info.addrs.extend(split.addrs),
            Some(info) => {
                return Err(AddrError::Ambiguous {
                    addr,
                    first: info.peer_id,
                    second: split.peer_id,
                });
            }
        }
    }

    found.ok_or(AddrError::ResolutionFailed(addr))
}

/// Split a multiaddr ending in `/p2p/<id>` into an [`AddrInfo`].
///
/// Returns `None` if the final component is not a peer identity.
pub fn split_peer_addr(addr: &Multiaddr) -> Option<AddrInfo> {
    let mut base = addr.clone();
    match base.pop() {
        Some(Protocol::P2p(peer_id)) => {
            let addrs = if base.is_empty() { Vec::new() } else { vec![base] };
            Some(AddrInfo { peer_id, addrs })
        }
        _ => None,
    }
}

/// The last `/p2p/` component of an address, if any.
///
/// For a relay circuit address this is the circuit's final target.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter()
        .filter_map(|proto| match proto {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .last()
}

/// The canonical `/p2p/<id>` form of a peer identity.
pub fn peer_multiaddr(peer_id: &PeerId) -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2p(*peer_id))
}

/// A two-hop relay address: client -> `relay` -> `target`.
pub fn circuit_addr(relay: &PeerId, target: &PeerId) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::P2p(*relay))
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(*target))
}

/// Convert a TCP/IP multiaddr to a socket address.
///
/// Returns `None` for addresses carrying anything other than
/// ip4/ip6 + tcp (+ an optional trailing peer id).
pub fn multiaddr_to_socketaddr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut ip = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(a) => ip = Some(IpAddr::V4(a)),
            Protocol::Ip6(a) => ip = Some(IpAddr::V6(a)),
            Protocol::Tcp(p) => port = Some(p),
            Protocol::P2p(_) => {}
            _ => return None,
        }
    }
    Some(SocketAddr::new(ip?, port?))
}

/// Convert a socket address to its multiaddr form.
pub fn socketaddr_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(a) => Protocol::Ip4(a),
        IpAddr::V6(a) => Protocol::Ip6(a),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use portmux_test_utils::MockOverlay;

    #[test]
    fn split_bare_peer_addr() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/p2p/{peer}").parse().unwrap();
        let info = split_peer_addr(&addr).unwrap();
        assert_eq!(info.peer_id, peer);
        assert!(info.addrs.is_empty());
    }

    #[test]
    fn split_full_peer_addr() {
        let peer = PeerId::random();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/tcp/1634/p2p/{peer}").parse().unwrap();
        let info = split_peer_addr(&addr).unwrap();
        assert_eq!(info.peer_id, peer);
        assert_eq!(info.addrs, vec!["/ip4/10.0.0.1/tcp/1634".parse().unwrap()]);
    }

    #[test]
    fn split_rejects_non_peer_addr() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/8080".parse().unwrap();
        assert!(split_peer_addr(&addr).is_none());
    }

    #[test]
    fn circuit_addr_shape() {
        let relay = PeerId::random();
        let target = PeerId::random();
        let addr = circuit_addr(&relay, &target);
        assert_eq!(
            addr.to_string(),
            format!("/p2p/{relay}/p2p-circuit/p2p/{target}")
        );
        assert_eq!(extract_peer_id(&addr), Some(target));
    }

    #[test]
    fn socketaddr_roundtrip() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/8000".parse().unwrap();
        let socket = multiaddr_to_socketaddr(&addr).unwrap();
        assert_eq!(socket.to_string(), "127.0.0.1:8000");
        assert_eq!(socketaddr_to_multiaddr(&socket), addr);
    }

    #[test]
    fn socketaddr_rejects_udp() {
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/8000".parse().unwrap();
        assert!(multiaddr_to_socketaddr(&addr).is_none());
    }

    #[tokio::test]
    async fn resolve_literal_without_network_call() {
        let net = MockOverlay::new();
        let peer = PeerId::random();
        let info = resolve(&net, &format!("/p2p/{peer}")).await.unwrap();
        assert_eq!(info.peer_id, peer);
        assert!(net.resolved_addrs().is_empty());
    }

    #[tokio::test]
    async fn resolve_invalid_multiaddr_fails() {
        let net = MockOverlay::new();
        let err = resolve(&net, "not-a-multiaddr").await.unwrap_err();
        assert!(matches!(err, AddrError::Parse(_)));
    }

    #[tokio::test]
    async fn resolve_symbolic_merges_addresses() {
        let net = MockOverlay::new();
        let peer = PeerId::random();
        let symbolic: Multiaddr = "/dnsaddr/forward.example.org".parse().unwrap();
        net.script_resolution(
            symbolic.clone(),
            vec![
                format!("/ip4/10.0.0.1/tcp/1634/p2p/{peer}").parse().unwrap(),
                format!("/ip4/10.0.0.2/tcp/1634/p2p/{peer}").parse().unwrap(),
            ],
        );

        let info = resolve(&net, "/dnsaddr/forward.example.org").await.unwrap();
        assert_eq!(info.peer_id, peer);
        assert_eq!(info.addrs.len(), 2);
    }

    #[tokio::test]
    async fn resolve_ambiguous_reports_both_peers() {
        let net = MockOverlay::new();
        let first = PeerId::random();
        let second = PeerId::random();
        let symbolic: Multiaddr = "/dnsaddr/forward.example.org".parse().unwrap();
        net.script_resolution(
            symbolic,
            vec![
                format!("/ip4/10.0.0.1/tcp/1634/p2p/{first}").parse().unwrap(),
                format!("/ip4/10.0.0.2/tcp/1634/p2p/{second}").parse().unwrap(),
            ],
        );

        let err = resolve(&net, "/dnsaddr/forward.example.org")
            .await
            .unwrap_err();
        match err {
            AddrError::Ambiguous {
                first: a,
                second: b,
                ..
            } => {
                assert_eq!((a, b), (first, second));
            }
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_without_peer_records_fails() {
        let net = MockOverlay::new();
        let symbolic: Multiaddr = "/dnsaddr/forward.example.org".parse().unwrap();
        net.script_resolution(
            symbolic,
            vec!["/ip4/10.0.0.1/tcp/1634".parse().unwrap()],
        );

        let err = resolve(&net, "/dnsaddr/forward.example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, AddrError::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn resolve_empty_records_fails() {
        let net = MockOverlay::new();
        let err = resolve(&net, "/dnsaddr/forward.example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, AddrError::ResolutionFailed(_)));
    }
}
