//! The port forwarding client facade.
//!
//! [`P2pClient`] ties the forwarding pieces together behind a small
//! string-typed surface: expose a protocol handler backed by a local
//! socket (`listen`), carry a local port to a remote peer (`forward`),
//! enumerate and close forwards, and tear the whole thing down
//! (`destroy`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libp2p::{Multiaddr, PeerId, StreamProtocol};
use portmux_addr::{peer_multiaddr, AddrError, AddrInfo};
use portmux_api::{OverlayError, OverlayNetwork};
use portmux_forwarder::{CircuitFallback, ForwardController, ForwardError, HealthChecker};
use portmux_registry::{Direction, ForwardInfo, ListenerRegistry};
use tracing::{debug, info, warn};

/// Protocol used by [`P2pClient::forward_with_random_port`].
pub const SSH_PROTOCOL: &str = "/x/ssh";

const RANDOM_PORT_RANGE: std::ops::Range<u16> = 30000..40000;

/// Errors surfaced by the client facade.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The client was destroyed; no further operations are served.
    #[error("client is closed")]
    Closed,

    /// A forward was requested with an empty peer id.
    #[error("peer id cannot be empty")]
    EmptyPeerId,

    /// The protocol name is not a valid stream protocol.
    #[error("invalid protocol name {0:?}, expected a /-prefixed path")]
    InvalidProtocol(String),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),
}

/// Facade over an overlay host, its forward registry, and the
/// forwarding machinery.
///
/// All operations check the closed flag first and fail with
/// [`ClientError::Closed`] after [`destroy`](Self::destroy).
pub struct P2pClient<N: OverlayNetwork> {
    net: Arc<N>,
    registry: Arc<ListenerRegistry>,
    controller: ForwardController<N>,
    health: HealthChecker<N>,
    fallback: CircuitFallback<N>,
    closed: AtomicBool,
}

impl<N: OverlayNetwork> P2pClient<N> {
    /// Build a client over `net`. `relays` is the fixed set of relay
    /// candidates for circuit fallback; it may be empty, in which case
    /// fallback fails with [`ForwardError::NoRelayAvailable`].
    pub fn new(net: Arc<N>, relays: Vec<AddrInfo>) -> Self {
        let registry = Arc::new(ListenerRegistry::new());
        Self {
            controller: ForwardController::new(net.clone(), registry.clone()),
            health: HealthChecker::new(net.clone()),
            fallback: CircuitFallback::new(net.clone(), relays),
            registry,
            net,
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.net.local_peer_id()
    }

    /// Expose `protocol` on the overlay, delivering each incoming
    /// stream to the local TCP address `target_addr`.
    pub async fn listen(
        &self,
        protocol: &str,
        target_addr: &str,
    ) -> Result<ForwardInfo, ClientError> {
        self.ensure_open()?;
        let protocol = parse_protocol(protocol)?;
        let target: Multiaddr = target_addr.parse().map_err(AddrError::Parse)?;
        Ok(self.controller.forward_remote(protocol, target).await?)
    }

    /// Forward local `port` to `protocol` on `peer_id`.
    ///
    /// The peer is health-probed first; if the probe fails, a relay
    /// circuit is established before the forward is created. Circuit
    /// errors propagate, including [`ForwardError::NoRelayAvailable`]
    /// when no relay candidates were configured.
    pub async fn forward(
        &self,
        protocol: &str,
        port: u16,
        peer_id: &str,
    ) -> Result<ForwardInfo, ClientError> {
        self.ensure_open()?;
        if peer_id.is_empty() {
            return Err(ClientError::EmptyPeerId);
        }
        let protocol = parse_protocol(protocol)?;
        let target = portmux_addr::resolve(&*self.net, &format!("/p2p/{peer_id}")).await?;

        if let Err(e) = self.health.check(&protocol, target.peer_id).await {
            warn!(peer = %target.peer_id, error = %e, "direct path down, trying relay circuit");
            let relay = self.fallback.establish_circuit(&target.peer_id).await?;
            info!(peer = %target.peer_id, %relay, "connected through relay");
        }

        let bind_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/{port}")
            .parse()
            .map_err(AddrError::Parse)?;
        Ok(self.controller.forward_local(protocol, bind_addr, target).await?)
    }

    /// Forward a random high port (30000-39999) to [`SSH_PROTOCOL`] on
    /// `peer_id`, reusing an existing forward to that peer if one is
    /// already registered.
    pub async fn forward_with_random_port(
        &self,
        peer_id: &str,
    ) -> Result<ForwardInfo, ClientError> {
        self.ensure_open()?;
        if peer_id.is_empty() {
            return Err(ClientError::EmptyPeerId);
        }

        let peer: PeerId = format!("/p2p/{peer_id}")
            .parse::<Multiaddr>()
            .map_err(AddrError::Parse)
            .and_then(|addr| {
                portmux_addr::split_peer_addr(&addr).ok_or(AddrError::ResolutionFailed(addr))
            })
            .map(|info| info.peer_id)?;
        let target_addr = peer_multiaddr(&peer);

        if let Some(existing) = self
            .registry
            .find(Direction::LocalToOverlay, |i| i.target_address == target_addr)
            .into_iter()
            .next()
        {
            debug!(forward = %existing, "reusing existing forward");
            return Ok(existing);
        }

        let port = rand::random_range(RANDOM_PORT_RANGE);
        self.forward(SSH_PROTOCOL, port, peer_id).await
    }

    /// Snapshot of every registered forward, local-to-overlay first.
    pub fn list(&self) -> Result<Vec<ForwardInfo>, ClientError> {
        self.ensure_open()?;
        Ok(self.registry.list_all())
    }

    /// Close every forward, in both directions, whose target address
    /// equals `target_addr`. Returns how many were closed.
    pub fn close(&self, target_addr: &str) -> Result<usize, ClientError> {
        self.ensure_open()?;
        let target: Multiaddr = target_addr.parse().map_err(AddrError::Parse)?;
        let count = self
            .registry
            .close_matching(Direction::LocalToOverlay, |i| i.target_address == target)
            + self
                .registry
                .close_matching(Direction::OverlayToLocal, |i| i.target_address == target);
        info!(target = %target, count, "closed forwards");
        Ok(count)
    }

    /// Close every forward and the overlay host, then refuse all
    /// further operations.
    pub async fn destroy(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::SeqCst);
        let count = self.registry.close_all();
        info!(count, "destroying client");
        self.net.close().await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }
}

fn parse_protocol(protocol: &str) -> Result<StreamProtocol, ClientError> {
    StreamProtocol::try_from_owned(protocol.to_owned())
        .map_err(|_| ClientError::InvalidProtocol(protocol.to_owned()))
}
