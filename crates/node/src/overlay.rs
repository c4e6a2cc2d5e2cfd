use std::time::Duration;

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use libp2p_stream::{Control, IncomingStreams};
use portmux_api::{OverlayError, OverlayNetwork};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::dns;
use crate::node::NodeCommand;

/// Bound on a dial settling, including relay circuit connects.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloneable handle to a running [`Node`](crate::Node).
///
/// Stream operations go straight through the swarm's stream control;
/// everything touching swarm state goes over the command channel to
/// the event loop.
#[derive(Clone)]
pub struct OverlayHandle {
    peer_id: PeerId,
    control: Control,
    command_tx: mpsc::UnboundedSender<NodeCommand>,
}

impl OverlayHandle {
    pub(crate) fn new(
        peer_id: PeerId,
        control: Control,
        command_tx: mpsc::UnboundedSender<NodeCommand>,
    ) -> Self {
        Self {
            peer_id,
            control,
            command_tx,
        }
    }

    fn send(&self, command: NodeCommand) -> Result<(), OverlayError> {
        self.command_tx
            .send(command)
            .map_err(|_| OverlayError::HostClosed)
    }
}

#[async_trait]
impl OverlayNetwork for OverlayHandle {
    type Stream = libp2p::Stream;
    type Incoming = IncomingStreams;

    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn dial(&self, addr: Multiaddr) -> Result<(), OverlayError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Dial { addr, reply })?;
        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OverlayError::HostClosed),
            Err(_) => Err(OverlayError::Timeout(DIAL_TIMEOUT)),
        }
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        timeout: Duration,
    ) -> Result<Self::Stream, OverlayError> {
        let mut control = self.control.clone();
        match tokio::time::timeout(timeout, control.open_stream(peer, protocol)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(OverlayError::Stream(e.to_string())),
            Err(_) => Err(OverlayError::Timeout(timeout)),
        }
    }

    fn register_stream_handler(
        &self,
        protocol: StreamProtocol,
    ) -> Result<Self::Incoming, OverlayError> {
        let mut control = self.control.clone();
        control
            .accept(protocol.clone())
            .map_err(|_| OverlayError::HandlerExists(protocol))
    }

    async fn resolve_symbolic(
        &self,
        addr: &Multiaddr,
        timeout: Duration,
    ) -> Result<Vec<Multiaddr>, OverlayError> {
        let resolved = tokio::time::timeout(timeout, dns::resolve_dnsaddr(addr))
            .await
            .map_err(|_| OverlayError::Timeout(timeout))?
            .map_err(|e| OverlayError::Resolve(e.to_string()))?;
        debug!(%addr, count = resolved.len(), "resolved symbolic address");
        Ok(resolved)
    }

    // the swarm's address book has no per-entry lifetime; entries fall
    // out when the peer record is replaced
    async fn add_addresses(&self, peer: PeerId, addrs: Vec<Multiaddr>, _ttl: Duration) {
        let _ = self.send(NodeCommand::AddAddresses { peer, addrs });
    }

    async fn close(&self) -> Result<(), OverlayError> {
        let (reply, rx) = oneshot::channel();
        if self.send(NodeCommand::Shutdown { reply }).is_err() {
            // already down
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // a handle whose event loop accepts the dial but never resolves it
    fn stalled_handle() -> (OverlayHandle, mpsc::UnboundedReceiver<NodeCommand>) {
        let behaviour = libp2p_stream::Behaviour::new();
        let control = behaviour.new_control();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (
            OverlayHandle::new(PeerId::random(), control, command_tx),
            command_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn dial_times_out_when_connection_never_settles() {
        let (handle, mut commands) = stalled_handle();
        let peer = PeerId::random();

        let err = handle
            .dial(format!("/ip4/10.0.0.1/tcp/4001/p2p/{peer}").parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, OverlayError::Timeout(d) if d == DIAL_TIMEOUT));
        // the command reached the loop; only its reply never came
        assert!(matches!(commands.try_recv(), Ok(NodeCommand::Dial { .. })));
    }
}
