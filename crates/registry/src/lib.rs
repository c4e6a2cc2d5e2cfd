//! Registry of active port forwards.
//!
//! Forwards run in one of two directions and each direction has its own
//! lock, so contention on one never blocks the other. The two locks are
//! never taken together; [`ListenerRegistry::list_all`] reads them in
//! turn and is therefore not a cross-direction atomic snapshot.

use libp2p::{Multiaddr, StreamProtocol};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which way bytes enter the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// A local socket accepting connections that are carried to a peer.
    LocalToOverlay,
    /// An overlay protocol handler delivering streams to a local socket.
    OverlayToLocal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::LocalToOverlay => write!(f, "local-to-overlay"),
            Direction::OverlayToLocal => write!(f, "overlay-to-local"),
        }
    }
}

/// Lock-free snapshot of a registered forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub direction: Direction,
    pub protocol: StreamProtocol,
    pub listen_address: Multiaddr,
    pub target_address: Multiaddr,
}

impl std::fmt::Display for ForwardInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol, self.listen_address, self.target_address
        )
    }
}

/// An active forward and the token that tears it down.
///
/// Cancelling the token stops the forward's accept loop and every
/// connection pipe it has spawned.
#[derive(Debug)]
pub struct Forward {
    info: ForwardInfo,
    token: CancellationToken,
}

impl Forward {
    pub fn new(
        direction: Direction,
        protocol: StreamProtocol,
        listen_address: Multiaddr,
        target_address: Multiaddr,
        token: CancellationToken,
    ) -> Self {
        Self {
            info: ForwardInfo {
                direction,
                protocol,
                listen_address,
                target_address,
            },
            token,
        }
    }

    pub fn info(&self) -> ForwardInfo {
        self.info.clone()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn close(&self) {
        debug!(forward = %self.info, "closing forward");
        self.token.cancel();
    }
}

/// The two-direction forward table.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    local: Mutex<Vec<Forward>>,
    overlay: Mutex<Vec<Forward>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, direction: Direction) -> &Mutex<Vec<Forward>> {
        match direction {
            Direction::LocalToOverlay => &self.local,
            Direction::OverlayToLocal => &self.overlay,
        }
    }

    /// Register a forward. Callers pre-check for duplicates with
    /// [`contains`](Self::contains); insertion itself does not.
    pub fn insert(&self, forward: Forward) {
        self.lane(forward.info.direction).lock().push(forward);
    }

    /// Whether a forward with this exact triple is registered.
    pub fn contains(
        &self,
        direction: Direction,
        protocol: &StreamProtocol,
        listen_address: &Multiaddr,
        target_address: &Multiaddr,
    ) -> bool {
        self.lane(direction).lock().iter().any(|forward| {
            forward.info.protocol == *protocol
                && forward.info.listen_address == *listen_address
                && forward.info.target_address == *target_address
        })
    }

    /// Snapshots of the forwards in `direction` matching `predicate`,
    /// in insertion order.
    pub fn find(
        &self,
        direction: Direction,
        predicate: impl Fn(&ForwardInfo) -> bool,
    ) -> Vec<ForwardInfo> {
        self.lane(direction)
            .lock()
            .iter()
            .map(Forward::info)
            .filter(predicate)
            .collect()
    }

    /// Cancel and remove the forwards in `direction` matching
    /// `predicate`, returning how many were closed.
    pub fn close_matching(
        &self,
        direction: Direction,
        predicate: impl Fn(&ForwardInfo) -> bool,
    ) -> usize {
        let mut lane = self.lane(direction).lock();
        let before = lane.len();
        lane.retain(|forward| {
            if predicate(&forward.info) {
                forward.close();
                false
            } else {
                true
            }
        });
        before - lane.len()
    }

    /// Cancel and remove every forward in both directions.
    pub fn close_all(&self) -> usize {
        self.close_matching(Direction::LocalToOverlay, |_| true)
            + self.close_matching(Direction::OverlayToLocal, |_| true)
    }

    /// Snapshots of every forward, local-to-overlay first.
    pub fn list_all(&self) -> Vec<ForwardInfo> {
        let mut all = self.find(Direction::LocalToOverlay, |_| true);
        all.extend(self.find(Direction::OverlayToLocal, |_| true));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(direction: Direction, protocol: &str, listen: &str, target: &str) -> Forward {
        Forward::new(
            direction,
            StreamProtocol::try_from_owned(protocol.to_owned()).unwrap(),
            listen.parse().unwrap(),
            target.parse().unwrap(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn insert_and_contains() {
        let registry = ListenerRegistry::new();
        let entry = forward(
            Direction::LocalToOverlay,
            "/x/ssh",
            "/ip4/127.0.0.1/tcp/8022",
            "/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T",
        );
        registry.insert(entry);

        assert!(registry.contains(
            Direction::LocalToOverlay,
            &StreamProtocol::new("/x/ssh"),
            &"/ip4/127.0.0.1/tcp/8022".parse().unwrap(),
            &"/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T"
                .parse()
                .unwrap(),
        ));
        assert!(!registry.contains(
            Direction::OverlayToLocal,
            &StreamProtocol::new("/x/ssh"),
            &"/ip4/127.0.0.1/tcp/8022".parse().unwrap(),
            &"/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T"
                .parse()
                .unwrap(),
        ));
    }

    #[test]
    fn close_matching_cancels_and_counts() {
        let registry = ListenerRegistry::new();
        let kept = forward(
            Direction::LocalToOverlay,
            "/x/ssh",
            "/ip4/127.0.0.1/tcp/8022",
            "/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T",
        );
        let closed = forward(
            Direction::LocalToOverlay,
            "/x/http",
            "/ip4/127.0.0.1/tcp/8080",
            "/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T",
        );
        let kept_token = kept.token().clone();
        let closed_token = closed.token().clone();
        registry.insert(kept);
        registry.insert(closed);

        let count = registry.close_matching(Direction::LocalToOverlay, |info| {
            info.protocol == StreamProtocol::new("/x/http")
        });

        assert_eq!(count, 1);
        assert!(closed_token.is_cancelled());
        assert!(!kept_token.is_cancelled());
        assert_eq!(registry.list_all().len(), 1);
    }

    #[test]
    fn close_all_empties_both_directions() {
        let registry = ListenerRegistry::new();
        registry.insert(forward(
            Direction::LocalToOverlay,
            "/x/ssh",
            "/ip4/127.0.0.1/tcp/8022",
            "/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T",
        ));
        registry.insert(forward(
            Direction::OverlayToLocal,
            "/x/ssh",
            "/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T",
            "/ip4/127.0.0.1/tcp/22",
        ));

        assert_eq!(registry.close_all(), 2);
        assert!(registry.list_all().is_empty());
        assert_eq!(registry.close_all(), 0);
    }

    #[test]
    fn list_all_orders_local_before_overlay() {
        let registry = ListenerRegistry::new();
        registry.insert(forward(
            Direction::OverlayToLocal,
            "/x/ssh",
            "/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T",
            "/ip4/127.0.0.1/tcp/22",
        ));
        registry.insert(forward(
            Direction::LocalToOverlay,
            "/x/ssh",
            "/ip4/127.0.0.1/tcp/8022",
            "/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nh6T",
        ));

        let all = registry.list_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all.first().map(|i| i.direction), Some(Direction::LocalToOverlay));
        assert_eq!(all.last().map(|i| i.direction), Some(Direction::OverlayToLocal));
    }
}
