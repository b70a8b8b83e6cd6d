use std::{
    fmt,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{Result, anyhow};
use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use futures::{Sink, SinkExt};
use tokio::{sync::Mutex, time::timeout};

use super::message::{Envelope, PeerId};

/// Upper bound of one write or close, the wait for the writer included.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type BoxSink = Pin<Box<dyn Sink<Message, Error = anyhow::Error> + Send>>;

struct Writer {
    sink: BoxSink,
    // generation of the last presence list written to this peer.
    presence: Option<u64>,
}

/// The write side of one peer's duplex channel.
///
/// The underlying channel is not safe for concurrent writers, so every write
/// goes through the per-connection writer lock. The raw sink is never handed
/// out. Reading is not done here: the session that created the connection
/// owns the stream half and runs the only read cycle.
pub struct Connection {
    id: PeerId,
    connected_at: DateTime<Utc>,
    closed: AtomicBool,
    writer: Mutex<Writer>,
}

impl Connection {
    pub fn new<S, E>(id: PeerId, sink: S) -> Self
    where
        S: Sink<Message, Error = E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            id,
            connected_at: Utc::now(),
            closed: AtomicBool::new(false),
            writer: Mutex::new(Writer {
                sink: Box::pin(sink.sink_map_err(anyhow::Error::from)),
                presence: None,
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one envelope as a text frame.
    ///
    /// Concurrent callers are serialized. The transport error is returned
    /// as is, nothing else is touched on failure. A peer that stops reading
    /// fails the write after [`WRITE_TIMEOUT`].
    pub async fn write_message(&self, envelope: &Envelope) -> Result<()> {
        let text = envelope.encode()?;
        self.bounded(async {
            let mut writer = self.writer.lock().await;
            self.send(&mut writer, Message::Text(text.into())).await
        })
        .await
    }

    /// Write a presence list taken at the given registry generation.
    ///
    /// Returns `false` without writing when an equal or newer list was
    /// already delivered, so racing broadcasts never leave a peer on a stale
    /// list.
    pub async fn write_presence(&self, generation: u64, envelope: &Envelope) -> Result<bool> {
        let text = envelope.encode()?;
        self.bounded(async {
            let mut writer = self.writer.lock().await;
            if writer.presence.is_some_and(|it| it >= generation) {
                return Ok(false);
            }

            self.send(&mut writer, Message::Text(text.into())).await?;
            writer.presence = Some(generation);
            Ok(true)
        })
        .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.bounded(async {
            let mut writer = self.writer.lock().await;
            self.send(&mut writer, Message::Ping(Default::default()))
                .await
        })
        .await
    }

    /// Release the transport.
    ///
    /// Only the first call closes the sink, later or concurrent calls return
    /// immediately.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.bounded(async { self.writer.lock().await.sink.close().await })
            .await
    }

    async fn bounded<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        timeout(WRITE_TIMEOUT, future)
            .await
            .map_err(|_| anyhow!("transport stalled: id={}", self.id))?
    }

    async fn send(&self, writer: &mut Writer, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("connection closed: id={}", self.id));
        }

        writer.sink.send(message).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}
