//! The overlay-network collaborator seam.
//!
//! Everything above the libp2p host programs against [`OverlayNetwork`]:
//! the forwarding core never touches a swarm directly, so it can be unit
//! tested against an in-memory implementation and the host can be swapped
//! without touching forwarding logic.

use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, Stream};
use libp2p::{Multiaddr, PeerId, StreamProtocol};

/// Error type for overlay operations.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// Dialing the given address failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Opening or negotiating a stream failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// A stream handler for this protocol is already registered.
    #[error("protocol {0} already has a stream handler")]
    HandlerExists(StreamProtocol),

    /// Symbolic address resolution failed.
    #[error("address resolution failed: {0}")]
    Resolve(String),

    /// The operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The overlay host has been shut down.
    #[error("overlay host is closed")]
    HostClosed,
}

/// The narrow interface to the peer-to-peer overlay.
///
/// Implemented by the libp2p host (`portmux-node`) and by the in-memory
/// mock (`portmux-test-utils`). The associated `Stream` type is a raw
/// byte stream multiplexed under a named protocol, analogous to a TCP
/// connection to a well-known port.
#[async_trait]
pub trait OverlayNetwork: Send + Sync + 'static {
    /// A raw byte stream to a peer.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Incoming streams accepted for a registered protocol.
    type Incoming: Stream<Item = (PeerId, Self::Stream)> + Send + Unpin + 'static;

    /// The local peer identity.
    fn local_peer_id(&self) -> PeerId;

    /// Dial a peer at `addr`, which may be a relay circuit address.
    ///
    /// Resolves once the connection is established (or fails), not merely
    /// once the dial has been queued.
    async fn dial(&self, addr: Multiaddr) -> Result<(), OverlayError>;

    /// Open a new stream to `peer` under `protocol`, bounded by `timeout`.
    ///
    /// Dials the peer first if no connection exists, using addresses
    /// previously supplied via [`add_addresses`](Self::add_addresses).
    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        timeout: Duration,
    ) -> Result<Self::Stream, OverlayError>;

    /// Claim `protocol` and return the stream of inbound streams for it.
    ///
    /// At most one handler may exist per protocol; a second registration
    /// fails with [`OverlayError::HandlerExists`].
    fn register_stream_handler(
        &self,
        protocol: StreamProtocol,
    ) -> Result<Self::Incoming, OverlayError>;

    /// Resolve a symbolic (e.g. `/dnsaddr/`) multiaddr into concrete
    /// address records, bounded by `timeout`.
    async fn resolve_symbolic(
        &self,
        addr: &Multiaddr,
        timeout: Duration,
    ) -> Result<Vec<Multiaddr>, OverlayError>;

    /// Record dialable addresses for `peer`.
    ///
    /// `ttl` is advisory; implementations without per-entry expiry may
    /// keep the addresses for the lifetime of the host.
    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>, ttl: Duration);

    /// Shut down the overlay host, closing all connections and streams.
    async fn close(&self) -> Result<(), OverlayError>;
}

/// Address validity used when registering a forward target's addresses.
///
/// Mirrors the short-lived "temporary address" validity of peerstore
/// entries: long enough to dial, not a permanent routing fact.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);
