use std::sync::Arc;

use libp2p::PeerId;
use portmux_addr::{circuit_addr, AddrInfo};
use portmux_api::{OverlayNetwork, TEMP_ADDR_TTL};
use rand::seq::IndexedRandom;
use tracing::{debug, info};

use crate::ForwardError;

/// Establishes relayed connections when the direct path to a peer is
/// down.
///
/// Relay candidates are fixed at construction. Each attempt picks one
/// uniformly at random; there is no exclusion memory across attempts,
/// a failed relay may be picked again.
pub struct CircuitFallback<N: OverlayNetwork> {
    net: Arc<N>,
    relays: Vec<AddrInfo>,
}

impl<N: OverlayNetwork> CircuitFallback<N> {
    pub fn new(net: Arc<N>, relays: Vec<AddrInfo>) -> Self {
        Self { net, relays }
    }

    /// Dial `target` through a randomly chosen relay.
    ///
    /// Returns the relay used on success. Fails with
    /// [`ForwardError::NoRelayAvailable`] when no candidates exist and
    /// [`ForwardError::CircuitFailed`] when the single dial attempt
    /// through the chosen relay fails.
    pub async fn establish_circuit(&self, target: &PeerId) -> Result<PeerId, ForwardError> {
        let relay = self
            .relays
            .choose(&mut rand::rng())
            .ok_or(ForwardError::NoRelayAvailable)?;
        debug!(relay = %relay.peer_id, %target, "attempting relay circuit");

        if !relay.addrs.is_empty() {
            self.net
                .add_addresses(relay.peer_id, relay.addrs.clone(), TEMP_ADDR_TTL)
                .await;
        }

        let addr = circuit_addr(&relay.peer_id, target);
        self.net
            .dial(addr.clone())
            .await
            .map_err(|source| ForwardError::CircuitFailed {
                relay: relay.peer_id,
                source,
            })?;

        info!(%addr, "relay circuit established");
        Ok(relay.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use portmux_test_utils::MockOverlay;

    #[tokio::test]
    async fn no_candidates_is_an_error() {
        let net = Arc::new(MockOverlay::new());
        let fallback = CircuitFallback::new(net, Vec::new());

        let err = fallback
            .establish_circuit(&PeerId::random())
            .await
            .unwrap_err();
        assert_matches!(err, ForwardError::NoRelayAvailable);
    }

    #[tokio::test]
    async fn dials_two_hop_circuit_through_relay() {
        let net = Arc::new(MockOverlay::new());
        let relay = PeerId::random();
        let target = PeerId::random();
        let fallback = CircuitFallback::new(
            net.clone(),
            vec![AddrInfo::new(
                relay,
                vec!["/ip4/10.0.0.9/tcp/1634".parse().unwrap()],
            )],
        );

        let used = fallback.establish_circuit(&target).await.unwrap();

        assert_eq!(used, relay);
        assert_eq!(net.dialed_addrs(), vec![circuit_addr(&relay, &target)]);
        assert_eq!(
            net.addresses_of(&relay),
            vec!["/ip4/10.0.0.9/tcp/1634".parse::<libp2p::Multiaddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn failed_dial_names_the_relay() {
        let net = Arc::new(MockOverlay::new());
        let relay = PeerId::random();
        let target = PeerId::random();
        net.fail_dial(circuit_addr(&relay, &target), "relay refused");
        let fallback = CircuitFallback::new(net, vec![AddrInfo::from_peer_id(relay)]);

        let err = fallback.establish_circuit(&target).await.unwrap_err();
        assert_matches!(err, ForwardError::CircuitFailed { relay: r, .. } if r == relay);
    }
}
