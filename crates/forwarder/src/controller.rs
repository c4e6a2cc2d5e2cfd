use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{Multiaddr, StreamProtocol};
use portmux_addr::{multiaddr_to_socketaddr, peer_multiaddr, socketaddr_to_multiaddr, AddrInfo};
use portmux_api::{OverlayNetwork, TEMP_ADDR_TTL};
use portmux_registry::{Direction, Forward, ForwardInfo, ListenerRegistry};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ForwardError;

/// Bound on opening a named stream for an accepted connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates forwards and runs their accept loops.
///
/// Creation in each direction is serialized by a per-direction setup
/// lock, so two concurrent identical requests resolve to one forward
/// and a no-op. The setup locks are independent of the registry's own
/// locks, which are never held across an await point.
pub struct ForwardController<N: OverlayNetwork> {
    net: Arc<N>,
    registry: Arc<ListenerRegistry>,
    local_setup: Mutex<()>,
    overlay_setup: Mutex<()>,
}

impl<N: OverlayNetwork> ForwardController<N> {
    pub fn new(net: Arc<N>, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            net,
            registry,
            local_setup: Mutex::new(()),
            overlay_setup: Mutex::new(()),
        }
    }

    /// Forward a local TCP listening socket to a named stream on `target`.
    ///
    /// An exact duplicate of an existing forward is a no-op returning
    /// the existing entry, without touching the overlay address book.
    /// On the create path the target's known addresses are recorded
    /// with a short TTL, matching the lifetime of a freshly resolved
    /// address. The forward is registered only after the bind succeeds;
    /// a bind address with port 0 registers under the actual assigned
    /// port.
    pub async fn forward_local(
        &self,
        protocol: StreamProtocol,
        bind_addr: Multiaddr,
        target: AddrInfo,
    ) -> Result<ForwardInfo, ForwardError> {
        let _setup = self.local_setup.lock().await;

        let target_addr = peer_multiaddr(&target.peer_id);
        if let Some(existing) = self
            .registry
            .find(Direction::LocalToOverlay, |info| {
                info.protocol == protocol
                    && info.listen_address == bind_addr
                    && info.target_address == target_addr
            })
            .into_iter()
            .next()
        {
            debug!(forward = %existing, "forward already exists");
            return Ok(existing);
        }

        if !target.addrs.is_empty() {
            self.net
                .add_addresses(target.peer_id, target.addrs.clone(), TEMP_ADDR_TTL)
                .await;
        }

        let socket = multiaddr_to_socketaddr(&bind_addr)
            .ok_or_else(|| ForwardError::UnsupportedAddress(bind_addr.clone()))?;
        let listener = TcpListener::bind(socket).await.map_err(|source| {
            ForwardError::Bind {
                addr: bind_addr.clone(),
                source,
            }
        })?;
        let listen_addr = listener
            .local_addr()
            .map(|addr| socketaddr_to_multiaddr(&addr))
            .map_err(|source| ForwardError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;

        let token = CancellationToken::new();
        self.spawn_local_accept(listener, protocol.clone(), target.peer_id, token.clone());

        let forward = Forward::new(
            Direction::LocalToOverlay,
            protocol,
            listen_addr,
            target_addr,
            token,
        );
        let info = forward.info();
        debug!(forward = %info, "forward established");
        self.registry.insert(forward);
        Ok(info)
    }

    /// Expose a named stream handler whose streams are delivered to a
    /// local TCP target.
    ///
    /// An exact duplicate is a no-op returning the existing entry.
    /// If the protocol's handler is claimed by something other than a
    /// registered forward, the overlay's conflict error propagates.
    pub async fn forward_remote(
        &self,
        protocol: StreamProtocol,
        target_addr: Multiaddr,
    ) -> Result<ForwardInfo, ForwardError> {
        let _setup = self.overlay_setup.lock().await;

        let listen_addr = peer_multiaddr(&self.net.local_peer_id());
        if let Some(existing) = self
            .registry
            .find(Direction::OverlayToLocal, |info| {
                info.protocol == protocol
                    && info.listen_address == listen_addr
                    && info.target_address == target_addr
            })
            .into_iter()
            .next()
        {
            debug!(forward = %existing, "forward already exists");
            return Ok(existing);
        }

        let socket = multiaddr_to_socketaddr(&target_addr)
            .ok_or_else(|| ForwardError::UnsupportedAddress(target_addr.clone()))?;
        let incoming = self.net.register_stream_handler(protocol.clone())?;

        let token = CancellationToken::new();
        self.spawn_remote_accept(incoming, socket, token.clone());

        let forward = Forward::new(
            Direction::OverlayToLocal,
            protocol,
            listen_addr,
            target_addr,
            token,
        );
        let info = forward.info();
        debug!(forward = %info, "forward established");
        self.registry.insert(forward);
        Ok(info)
    }

    fn spawn_local_accept(
        &self,
        listener: TcpListener,
        protocol: StreamProtocol,
        peer: libp2p::PeerId,
        token: CancellationToken,
    ) {
        let net = self.net.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let (conn, remote) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        debug!(%remote, %peer, "accepted connection");
                        let net = net.clone();
                        let protocol = protocol.clone();
                        let conn_token = token.child_token();
                        tokio::spawn(async move {
                            match net.open_stream(peer, protocol, CONNECT_TIMEOUT).await {
                                Ok(stream) => pipe(stream, conn, conn_token).await,
                                Err(e) => warn!(%peer, error = %e, "failed to open stream"),
                            }
                        });
                    }
                }
            }
            debug!("local accept loop stopped");
        });
    }

    fn spawn_remote_accept(
        &self,
        mut incoming: N::Incoming,
        target: std::net::SocketAddr,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = incoming.next() => {
                        let Some((peer, stream)) = next else { break };
                        debug!(%peer, %target, "incoming stream");
                        let conn_token = token.child_token();
                        tokio::spawn(async move {
                            match TcpStream::connect(target).await {
                                Ok(conn) => pipe(stream, conn, conn_token).await,
                                Err(e) => warn!(%target, error = %e, "failed to reach local target"),
                            }
                        });
                    }
                }
            }
            debug!("stream handler loop stopped");
        });
    }
}

/// Copy bytes both ways until either side closes or the forward is
/// torn down.
async fn pipe<S>(stream: S, mut conn: TcpStream, token: CancellationToken)
where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut stream = stream.compat();
    tokio::select! {
        _ = token.cancelled() => debug!("connection cancelled"),
        result = tokio::io::copy_bidirectional(&mut conn, &mut stream) => match result {
            Ok((sent, received)) => debug!(sent, received, "connection finished"),
            Err(e) => debug!(error = %e, "connection ended with error"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use libp2p::PeerId;
    use portmux_api::OverlayError;
    use portmux_test_utils::MockOverlay;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn setup() -> (
        Arc<MockOverlay>,
        Arc<ListenerRegistry>,
        ForwardController<MockOverlay>,
    ) {
        let net = Arc::new(MockOverlay::new());
        let registry = Arc::new(ListenerRegistry::new());
        let controller = ForwardController::new(net.clone(), registry.clone());
        (net, registry, controller)
    }

    fn proto(s: &str) -> StreamProtocol {
        StreamProtocol::try_from_owned(s.to_owned()).unwrap()
    }

    async fn opened_stream(net: &MockOverlay) -> (PeerId, StreamProtocol, DuplexStream) {
        for _ in 0..100 {
            if let Some(entry) = net.take_opened().pop() {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no stream was opened");
    }

    #[tokio::test]
    async fn forward_local_pipes_both_ways() {
        let (net, _registry, controller) = setup();
        let target = AddrInfo::from_peer_id(PeerId::random());

        let info = controller
            .forward_local(
                proto("/x/ssh"),
                "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
                target.clone(),
            )
            .await
            .unwrap();

        let socket = multiaddr_to_socketaddr(&info.listen_address).unwrap();
        let mut conn = TcpStream::connect(socket).await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        let (peer, protocol, mut remote) = opened_stream(&net).await;
        assert_eq!(peer, target.peer_id);
        assert_eq!(protocol, proto("/x/ssh"));

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"world").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn forward_local_records_target_addresses() {
        let (net, _registry, controller) = setup();
        let peer = PeerId::random();
        let target = AddrInfo::new(peer, vec!["/ip4/10.0.0.1/tcp/1634".parse().unwrap()]);

        controller
            .forward_local(proto("/x/ssh"), "/ip4/127.0.0.1/tcp/0".parse().unwrap(), target)
            .await
            .unwrap();

        assert_eq!(
            net.addresses_of(&peer),
            vec!["/ip4/10.0.0.1/tcp/1634".parse::<Multiaddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn duplicate_forward_leaves_address_book_untouched() {
        let (net, _registry, controller) = setup();
        let peer = PeerId::random();
        let target = AddrInfo::new(peer, vec!["/ip4/10.0.0.1/tcp/1634".parse().unwrap()]);

        let info = controller
            .forward_local(
                proto("/x/ssh"),
                "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
                target.clone(),
            )
            .await
            .unwrap();
        controller
            .forward_local(proto("/x/ssh"), info.listen_address.clone(), target)
            .await
            .unwrap();

        assert_eq!(net.addresses_of(&peer).len(), 1);
    }

    #[tokio::test]
    async fn forward_local_duplicate_is_noop() {
        let (_net, registry, controller) = setup();
        let target = AddrInfo::from_peer_id(PeerId::random());

        let info = controller
            .forward_local(
                proto("/x/ssh"),
                "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
                target.clone(),
            )
            .await
            .unwrap();

        // rebinding the assigned port would fail, so success proves the
        // duplicate short-circuited before the bind
        let again = controller
            .forward_local(proto("/x/ssh"), info.listen_address.clone(), target)
            .await
            .unwrap();

        assert_eq!(again, info);
        assert_eq!(registry.list_all().len(), 1);
    }

    #[tokio::test]
    async fn forward_local_rejects_non_tcp_bind() {
        let (_net, _registry, controller) = setup();
        let err = controller
            .forward_local(
                proto("/x/ssh"),
                "/ip4/127.0.0.1/udp/4001".parse().unwrap(),
                AddrInfo::from_peer_id(PeerId::random()),
            )
            .await
            .unwrap_err();
        assert_matches!(err, ForwardError::UnsupportedAddress(_));
    }

    #[tokio::test]
    async fn forward_remote_delivers_to_local_service() {
        let (net, _registry, controller) = setup();
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = socketaddr_to_multiaddr(&service.local_addr().unwrap());

        let info = controller
            .forward_remote(proto("/x/ssh"), target.clone())
            .await
            .unwrap();
        assert_eq!(info.listen_address, peer_multiaddr(&net.local_peer_id()));
        assert_eq!(info.target_address, target);

        let mut remote = net.inject_stream(&proto("/x/ssh"), PeerId::random());
        remote.write_all(b"ping").await.unwrap();

        let (mut conn, _) = service.accept().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn forward_remote_duplicate_is_noop() {
        let (_net, registry, controller) = setup();
        let target: Multiaddr = "/ip4/127.0.0.1/tcp/22".parse().unwrap();

        let info = controller
            .forward_remote(proto("/x/ssh"), target.clone())
            .await
            .unwrap();
        // a second registration of the handler would conflict, so
        // success proves the duplicate short-circuited
        let again = controller.forward_remote(proto("/x/ssh"), target).await.unwrap();

        assert_eq!(again, info);
        assert_eq!(registry.list_all().len(), 1);
    }

    #[tokio::test]
    async fn forward_remote_reports_foreign_handler_conflict() {
        let (net, _registry, controller) = setup();
        let _held = net.register_stream_handler(proto("/x/ssh")).unwrap();

        let err = controller
            .forward_remote(proto("/x/ssh"), "/ip4/127.0.0.1/tcp/22".parse().unwrap())
            .await
            .unwrap_err();
        assert_matches!(err, ForwardError::Stream(OverlayError::HandlerExists(_)));
    }

    #[tokio::test]
    async fn close_all_tears_down_live_connections() {
        let (net, registry, controller) = setup();
        let target = AddrInfo::from_peer_id(PeerId::random());

        let info = controller
            .forward_local(
                proto("/x/ssh"),
                "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
                target,
            )
            .await
            .unwrap();

        let socket = multiaddr_to_socketaddr(&info.listen_address).unwrap();
        let mut conn = TcpStream::connect(socket).await.unwrap();
        conn.write_all(b"hi").await.unwrap();
        let (_, _, mut remote) = opened_stream(&net).await;
        let mut buf = [0u8; 2];
        remote.read_exact(&mut buf).await.unwrap();

        assert_eq!(registry.close_all(), 1);

        // the pipe drops both ends once its token fires
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
