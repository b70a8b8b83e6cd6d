//! ## The signaling relay
//!
//! Establishing a WebRTC connection between two devices requires a
//! signaling server to let the two peers find each other and exchange their
//! session descriptions and candidates. The server does not interpret the
//! content of these messages, it only has to deliver them to the right peer.
//!
//! ## The signaling protocol
//!
//! Every frame is a json object:
//!
//! * `event`: message tag.
//! * `data`: opaque payload.
//! * `from`: sender id, always written by the server.
//! * `to`: target peer id.
//!
//! The server sends `welcome` with the assigned id right after connecting,
//! and `peers` with the list of connected peers whenever it changes. Any
//! other event is relayed to the peer named in `to`.

pub mod connection;
pub mod message;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;

pub use self::{
    connection::Connection,
    message::{Envelope, PEERS, PeerId, PresenceEntry, WELCOME},
    presence::PresenceBroadcaster,
    registry::{Registry, Snapshot},
    router::{Dispatch, Router},
    session::{Session, SessionOptions, State, Termination},
};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Everything a new connection needs, shared by all sessions.
#[derive(Clone)]
pub struct Signaling {
    registry: Arc<Registry>,
    options: SessionOptions,
    shutdown: CancellationToken,
}

impl Signaling {
    pub fn new(options: SessionOptions, shutdown: CancellationToken) -> Self {
        Self {
            registry: Registry::new(),
            options,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Start a session for a transport that is being upgraded.
    pub fn session(&self, addr: Option<SocketAddr>) -> Session {
        Session::new(
            addr,
            self.registry.clone(),
            self.options,
            self.shutdown.clone(),
        )
    }

    /// Close every connection that is still registered.
    ///
    /// Used when the shutdown grace period is over. Each close is given the
    /// same bounded time, a close stuck behind a stalled write is abandoned.
    pub async fn close_all(&self, limit: Duration) -> usize {
        let snapshot = self.registry.snapshot();
        join_all(snapshot.connections.iter().map(|conn| async move {
            if timeout(limit, conn.close()).await.is_err() {
                log::warn!("forced close timed out: id={}", conn.id());
            }
        }))
        .await;

        snapshot.connections.len()
    }
}
