use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;

use super::{
    connection::Connection,
    message::{PeerId, PresenceEntry},
};

/// A consistent copy of the registry taken at one instant.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Registry mutation counter at the time of the copy.
    pub generation: u64,
    pub peers: Vec<PresenceEntry>,
    pub connections: Vec<Arc<Connection>>,
}

#[derive(Default)]
struct Peers {
    table: HashMap<PeerId, Arc<Connection>>,
    generation: u64,
}

/// Record of the currently connected peers.
///
/// All methods take the internal lock for the duration of a map operation
/// only, the lock is never held across an await point.
#[derive(Default)]
pub struct Registry(RwLock<Peers>);

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(RwLock::new(Peers {
            table: HashMap::with_capacity(1024),
            generation: 0,
        })))
    }

    /// Insert the connection under its identifier.
    pub fn register(&self, conn: Arc<Connection>) -> PeerId {
        let id = *conn.id();

        let mut peers = self.0.write();
        if peers.table.insert(id, conn).is_some() {
            log::warn!("registry replaced an existing peer: id={id}");
        }

        peers.generation += 1;
        id
    }

    /// Remove the peer if present. Removing an absent peer does nothing.
    pub fn unregister(&self, id: &PeerId) -> Option<Arc<Connection>> {
        let mut peers = self.0.write();
        let conn = peers.table.remove(id)?;

        peers.generation += 1;
        Some(conn)
    }

    pub fn lookup(&self, id: &PeerId) -> Option<Arc<Connection>> {
        self.0.read().table.get(id).cloned()
    }

    /// Copy the current state.
    ///
    /// Only references are copied under the lock, callers do their io on the
    /// returned copy.
    pub fn snapshot(&self) -> Snapshot {
        let (generation, mut connections) = {
            let peers = self.0.read();
            (
                peers.generation,
                peers.table.values().cloned().collect::<Vec<_>>(),
            )
        };

        connections.sort_by(|a, b| {
            a.connected_at()
                .cmp(&b.connected_at())
                .then_with(|| a.id().cmp(b.id()))
        });

        Snapshot {
            generation,
            peers: connections
                .iter()
                .map(|it| PresenceEntry {
                    id: *it.id(),
                    connected_at: it.connected_at(),
                })
                .collect(),
            connections,
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use axum::extract::ws::Message;
    use futures::sink::drain;

    use super::*;

    fn connection() -> Arc<Connection> {
        Arc::new(Connection::new(
            PeerId::generate(),
            drain::<Message>(),
        ))
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = Registry::new();
        let conn = connection();

        let id = registry.register(conn.clone());
        assert_eq!(&id, conn.id());
        assert!(Arc::ptr_eq(&registry.lookup(&id).unwrap(), &conn));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&id).is_some());
        assert!(registry.lookup(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_absent_is_a_noop() {
        let registry = Registry::new();
        let generation = registry.snapshot().generation;

        assert!(registry.unregister(&PeerId::generate()).is_none());
        assert_eq!(registry.snapshot().generation, generation);
    }

    #[test]
    fn snapshot_is_ordered_and_versioned() {
        let registry = Registry::new();
        let a = connection();
        std::thread::sleep(Duration::from_millis(2));
        let b = connection();

        registry.register(a.clone());
        let first = registry.snapshot();
        registry.register(b.clone());
        let second = registry.snapshot();

        assert!(second.generation > first.generation);
        assert_eq!(first.peers.len(), 1);
        assert_eq!(second.peers.len(), 2);
        assert_eq!(second.peers[0].id, *a.id());
        assert_eq!(second.peers[1].id, *b.id());
        assert_eq!(second.connections.len(), 2);
    }

    #[test]
    fn snapshot_does_not_follow_later_changes() {
        let registry = Registry::new();
        let conn = connection();
        let id = registry.register(conn);

        let snapshot = registry.snapshot();
        registry.unregister(&id);

        assert_eq!(snapshot.peers.len(), 1);
        assert!(registry.snapshot().peers.is_empty());
    }

    #[test]
    fn concurrent_registration_yields_distinct_ids() {
        let registry = Registry::new();

        let handles = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..64)
                        .map(|_| registry.register(connection()))
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let ids = handles
            .into_iter()
            .flat_map(|it| it.join().unwrap())
            .collect::<HashSet<_>>();

        assert_eq!(ids.len(), 8 * 64);
        assert_eq!(registry.len(), 8 * 64);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.generation, 8 * 64);
        assert!(snapshot.peers.iter().all(|it| ids.contains(&it.id)));
    }

    #[test]
    fn snapshots_never_see_half_applied_mutations() {
        // Every mutation changes the table size by exactly one and bumps the
        // generation by one, so a consistent copy always satisfies
        // `generation - size` being even when registers and unregisters are
        // paired per worker.
        let registry = Registry::new();

        let writers = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let id = registry.register(connection());
                        registry.unregister(&id);
                    }
                })
            })
            .collect::<Vec<_>>();

        let reader = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let snapshot = registry.snapshot();
                    assert_eq!(snapshot.peers.len(), snapshot.connections.len());
                    assert_eq!((snapshot.generation - snapshot.peers.len() as u64) % 2, 0);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }

        reader.join().unwrap();
        assert!(registry.is_empty());
    }
}
