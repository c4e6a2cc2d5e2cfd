//! In-memory overlay test double.
//!
//! [`MockOverlay`] implements [`OverlayNetwork`] over in-process duplex
//! pipes, with scripted resolution records and per-peer stream failures,
//! so the forwarding layers can be exercised without a real swarm.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use parking_lot::Mutex;
use portmux_api::{OverlayError, OverlayNetwork};
use tokio::io::DuplexStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

/// Stream type handed out by the mock: a tokio duplex pipe adapted to
/// the `futures` io traits the overlay interface requires.
pub type MockStream = Compat<DuplexStream>;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct MockState {
    resolutions: HashMap<Multiaddr, Vec<Multiaddr>>,
    resolved: Vec<Multiaddr>,
    dialed: Vec<Multiaddr>,
    dial_failures: HashMap<Multiaddr, String>,
    unreachable: HashSet<PeerId>,
    opened: Vec<(PeerId, StreamProtocol, DuplexStream)>,
    handlers: HashMap<StreamProtocol, mpsc::UnboundedSender<(PeerId, MockStream)>>,
    addresses: HashMap<PeerId, Vec<Multiaddr>>,
    closed: bool,
}

/// A scriptable in-process [`OverlayNetwork`].
pub struct MockOverlay {
    peer_id: PeerId,
    state: Mutex<MockState>,
}

impl MockOverlay {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            peer_id: PeerId::random(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Script the records returned for a symbolic address.
    pub fn script_resolution(&self, addr: Multiaddr, records: Vec<Multiaddr>) {
        self.state.lock().resolutions.insert(addr, records);
    }

    /// Script a dial failure for an exact address.
    pub fn fail_dial(&self, addr: Multiaddr, message: impl Into<String>) {
        self.state.lock().dial_failures.insert(addr, message.into());
    }

    /// Make stream opens toward `peer` fail until a dial reaches it.
    ///
    /// A successful dial of an address whose final `/p2p/` component is
    /// `peer` (a direct or relayed connection) clears the failure.
    pub fn fail_streams_to(&self, peer: PeerId) {
        self.state.lock().unreachable.insert(peer);
    }

    /// Push an inbound stream at a registered handler, returning the
    /// remote end for the test to read and write.
    pub fn inject_stream(&self, protocol: &StreamProtocol, peer: PeerId) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let state = self.state.lock();
        let sender = state.handlers.get(protocol).unwrap();
        sender.unbounded_send((peer, local.compat())).unwrap();
        remote
    }

    /// Symbolic addresses resolution was attempted for, in order.
    pub fn resolved_addrs(&self) -> Vec<Multiaddr> {
        self.state.lock().resolved.clone()
    }

    /// Addresses dialed so far, in order.
    pub fn dialed_addrs(&self) -> Vec<Multiaddr> {
        self.state.lock().dialed.clone()
    }

    /// Drain the remote ends of streams opened through the mock.
    pub fn take_opened(&self) -> Vec<(PeerId, StreamProtocol, DuplexStream)> {
        std::mem::take(&mut self.state.lock().opened)
    }

    /// Addresses recorded for `peer` via `add_addresses`.
    pub fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.state
            .lock()
            .addresses
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn ensure_open(state: &MockState) -> Result<(), OverlayError> {
        if state.closed {
            Err(OverlayError::HostClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OverlayNetwork for MockOverlay {
    type Stream = MockStream;
    type Incoming = mpsc::UnboundedReceiver<(PeerId, MockStream)>;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn dial(&self, addr: Multiaddr) -> Result<(), OverlayError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if let Some(message) = state.dial_failures.get(&addr) {
            return Err(OverlayError::Dial(message.clone()));
        }
        if let Some(peer) = last_peer(&addr) {
            state.unreachable.remove(&peer);
        }
        state.dialed.push(addr);
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        _timeout: Duration,
    ) -> Result<Self::Stream, OverlayError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.unreachable.contains(&peer) {
            return Err(OverlayError::Stream(format!("no route to {peer}")));
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        state.opened.push((peer, protocol, remote));
        Ok(local.compat())
    }

    fn register_stream_handler(
        &self,
        protocol: StreamProtocol,
    ) -> Result<Self::Incoming, OverlayError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.handlers.contains_key(&protocol) {
            return Err(OverlayError::HandlerExists(protocol));
        }
        let (sender, receiver) = mpsc::unbounded();
        state.handlers.insert(protocol, sender);
        Ok(receiver)
    }

    async fn resolve_symbolic(
        &self,
        addr: &Multiaddr,
        _timeout: Duration,
    ) -> Result<Vec<Multiaddr>, OverlayError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.resolved.push(addr.clone());
        Ok(state.resolutions.get(addr).cloned().unwrap_or_default())
    }

    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>, _ttl: Duration) {
        self.state
            .lock()
            .addresses
            .entry(peer)
            .or_default()
            .extend(addrs);
    }

    async fn close(&self) -> Result<(), OverlayError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.handlers.clear();
        Ok(())
    }
}

fn last_peer(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter()
        .filter_map(|proto| match proto {
            libp2p::multiaddr::Protocol::P2p(peer) => Some(peer),
            _ => None,
        })
        .last()
}
