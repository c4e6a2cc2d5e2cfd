use std::sync::Arc;
use std::time::Duration;

use libp2p::{PeerId, StreamProtocol};
use portmux_api::OverlayNetwork;
use tracing::debug;

use crate::ForwardError;

/// Bound on the health probe stream open.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Probes whether a peer currently accepts named streams.
pub struct HealthChecker<N: OverlayNetwork> {
    net: Arc<N>,
}

impl<N: OverlayNetwork> HealthChecker<N> {
    pub fn new(net: Arc<N>) -> Self {
        Self { net }
    }

    /// Open and immediately drop a probe stream to `peer`.
    ///
    /// Any failure, including timeout, is reported as
    /// [`ForwardError::Unreachable`]; callers decide whether to fall
    /// back to a relay circuit.
    pub async fn check(&self, protocol: &StreamProtocol, peer: PeerId) -> Result<(), ForwardError> {
        match self
            .net
            .open_stream(peer, protocol.clone(), HEALTH_CHECK_TIMEOUT)
            .await
        {
            Ok(stream) => {
                debug!(%peer, %protocol, "health check passed");
                drop(stream);
                Ok(())
            }
            Err(source) => Err(ForwardError::Unreachable { peer, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use portmux_test_utils::MockOverlay;

    #[tokio::test]
    async fn reachable_peer_passes() {
        let net = Arc::new(MockOverlay::new());
        let checker = HealthChecker::new(net.clone());
        let peer = PeerId::random();

        checker
            .check(&StreamProtocol::new("/x/ssh"), peer)
            .await
            .unwrap();
        assert_eq!(net.take_opened().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_fails() {
        let net = Arc::new(MockOverlay::new());
        let checker = HealthChecker::new(net.clone());
        let peer = PeerId::random();
        net.fail_streams_to(peer);

        let err = checker
            .check(&StreamProtocol::new("/x/ssh"), peer)
            .await
            .unwrap_err();
        assert_matches!(err, ForwardError::Unreachable { peer: p, .. } if p == peer);
    }
}
