use std::sync::Arc;

use futures::future::join_all;

use super::{message::Envelope, registry::Registry};

/// Pushes the current peer list to every connected peer.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    registry: Arc<Registry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Fan the current registry snapshot out to every peer in it.
    ///
    /// Delivery is best effort: the writes run concurrently against the
    /// snapshot, so one slow or broken peer neither stops nor delays the
    /// others. Returns the number of peers that received the list.
    pub async fn broadcast(&self) -> usize {
        let snapshot = self.registry.snapshot();
        let envelope = match Envelope::peers(&snapshot.peers) {
            Ok(it) => it,
            Err(e) => {
                log::error!("failed to serialize peer list: error={e}");
                return 0;
            }
        };

        let results = join_all(
            snapshot
                .connections
                .iter()
                .map(|conn| conn.write_presence(snapshot.generation, &envelope)),
        )
        .await;

        let mut delivered = 0;
        for (conn, result) in snapshot.connections.iter().zip(results) {
            match result {
                Ok(true) => delivered += 1,
                Ok(false) => (),
                Err(e) => {
                    log::warn!("failed to send peer list: id={}, error={e}", conn.id());
                }
            }
        }

        log::debug!(
            "peer list broadcast: generation={}, peers={}, delivered={delivered}",
            snapshot.generation,
            snapshot.peers.len(),
        );

        delivered
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::ws::Message;
    use futures::channel::mpsc;
    use serde_json::Value;

    use super::*;
    use crate::signaling::{Connection, PEERS, PeerId};

    fn join(registry: &Registry) -> (PeerId, mpsc::UnboundedReceiver<Message>) {
        let (sink, rx) = mpsc::unbounded();
        let id = registry.register(Arc::new(Connection::new(PeerId::generate(), sink)));
        (id, rx)
    }

    fn peer_list(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected a peer list");
        };

        let envelope: Envelope = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(envelope.event, PEERS);
        assert_eq!(envelope.to, None);
        assert_eq!(envelope.from, None);

        let list: Vec<Value> = serde_json::from_str(&envelope.data.unwrap()).unwrap();
        list.into_iter()
            .map(|it| {
                assert!(it["connectedAt"].is_string());
                it["id"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn every_peer_receives_the_list() {
        let registry = Registry::new();
        let broadcaster = PresenceBroadcaster::new(registry.clone());
        let (a, mut rx_a) = join(&registry);
        let (b, mut rx_b) = join(&registry);

        assert_eq!(broadcaster.broadcast().await, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let mut ids = peer_list(rx);
            ids.sort();

            let mut expected = vec![a.to_string(), b.to_string()];
            expected.sort();
            assert_eq!(ids, expected);
        }
    }

    #[tokio::test]
    async fn broken_peer_does_not_abort_delivery() {
        let registry = Registry::new();
        let broadcaster = PresenceBroadcaster::new(registry.clone());
        let (_, rx_a) = join(&registry);
        let (_, mut rx_b) = join(&registry);
        drop(rx_a);

        assert_eq!(broadcaster.broadcast().await, 1);
        assert_eq!(peer_list(&mut rx_b).len(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn departed_peer_is_absent_from_next_list() {
        let registry = Registry::new();
        let broadcaster = PresenceBroadcaster::new(registry.clone());
        let (a, _rx_a) = join(&registry);
        let (b, mut rx_b) = join(&registry);

        registry.unregister(&a);
        broadcaster.broadcast().await;

        assert_eq!(peer_list(&mut rx_b), vec![b.to_string()]);
    }

    #[tokio::test]
    async fn unchanged_registry_is_not_sent_twice() {
        let registry = Registry::new();
        let broadcaster = PresenceBroadcaster::new(registry.clone());
        let (_, mut rx) = join(&registry);

        assert_eq!(broadcaster.broadcast().await, 1);
        assert_eq!(broadcaster.broadcast().await, 0);

        peer_list(&mut rx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_registry_is_a_noop() {
        let broadcaster = PresenceBroadcaster::new(Registry::new());
        assert_eq!(broadcaster.broadcast().await, 0);
    }
}
