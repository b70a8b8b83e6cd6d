use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use futures::{Sink, Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;

use super::{
    connection::Connection,
    message::{Envelope, PeerId},
    presence::PresenceBroadcaster,
    registry::Registry,
    router::Router,
};

// Stand-in period for a disabled timer, the branch is never polled.
const DISABLED: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Upgrading,
    Welcoming,
    Registered,
    Relaying,
    Closing,
    Closed,
}

impl State {
    fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Upgrading, Self::Welcoming)
                | (Self::Welcoming, Self::Registered)
                | (Self::Welcoming, Self::Closed)
                | (Self::Registered, Self::Relaying)
                | (Self::Relaying, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The welcome could not be delivered, the peer was never registered.
    WelcomeFailed,
    /// Close frame or end of stream.
    PeerClosed,
    ReadError(String),
    IdleTimeout,
    Shutdown,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WelcomeFailed => write!(f, "welcome failed"),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Tear the session down when nothing was read for this long.
    pub idle_timeout: Option<Duration>,
    /// Period of the keepalive pings.
    pub ping_interval: Option<Duration>,
}

/// Drives one peer from an accepted transport to relaying and back down.
///
/// A session is consumed by [`Session::run`], so the teardown happens once.
pub struct Session {
    state: State,
    addr: Option<SocketAddr>,
    registry: Arc<Registry>,
    router: Router,
    broadcaster: PresenceBroadcaster,
    options: SessionOptions,
    shutdown: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        addr: Option<SocketAddr>,
        registry: Arc<Registry>,
        options: SessionOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: State::Upgrading,
            router: Router::new(registry.clone()),
            broadcaster: PresenceBroadcaster::new(registry.clone()),
            registry,
            options,
            shutdown,
            addr,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Run the session over an upgraded transport until it terminates.
    ///
    /// `sink` and `stream` are the two halves of the duplex channel. The
    /// stream is read only here.
    pub async fn run<S, E, R, F>(mut self, sink: S, mut stream: R) -> Termination
    where
        S: Sink<Message, Error = E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        R: Stream<Item = Result<Message, F>> + Unpin + Send,
        F: fmt::Display + Send,
    {
        self.advance(State::Welcoming);

        let id = PeerId::generate();
        let conn = Arc::new(Connection::new(id, sink));
        if let Err(e) = conn.write_message(&Envelope::welcome(&id)).await {
            log::warn!("failed to welcome peer: id={id}, addr={:?}, error={e}", self.addr);

            if let Err(e) = conn.close().await {
                log::debug!("close transport failed: id={id}, error={e}");
            }

            self.advance(State::Closed);
            return Termination::WelcomeFailed;
        }

        self.advance(State::Registered);
        self.registry.register(conn.clone());

        log::info!(
            "peer connected: id={id}, addr={:?}, peers={}",
            self.addr,
            self.registry.len()
        );

        self.broadcaster.broadcast().await;

        self.advance(State::Relaying);
        let termination = self.read_cycle(&conn, &mut stream).await;

        self.advance(State::Closing);
        self.registry.unregister(&id);
        self.broadcaster.broadcast().await;

        if let Err(e) = conn.close().await {
            log::debug!("close transport failed: id={id}, error={e}");
        }

        self.advance(State::Closed);

        log::info!(
            "peer disconnected: id={id}, addr={:?}, reason={termination}, peers={}",
            self.addr,
            self.registry.len()
        );

        termination
    }

    async fn read_cycle<R, F>(&self, conn: &Connection, stream: &mut R) -> Termination
    where
        R: Stream<Item = Result<Message, F>> + Unpin + Send,
        F: fmt::Display + Send,
    {
        let id = conn.id();

        let period = self.options.ping_interval.unwrap_or(DISABLED);
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let idle = self.options.idle_timeout.unwrap_or(DISABLED);
        let deadline = sleep(idle);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Termination::Shutdown,
                message = stream.next() => {
                    let message = match message {
                        Some(Ok(it)) => it,
                        Some(Err(e)) => return Termination::ReadError(e.to_string()),
                        None => return Termination::PeerClosed,
                    };

                    deadline.as_mut().reset(Instant::now() + idle);

                    match message {
                        Message::Text(text) => {
                            self.router.dispatch(id, text.as_str()).await;
                        }
                        Message::Binary(bytes) => {
                            log::debug!("ignore binary frame: id={id}, size={}", bytes.len());
                        }
                        Message::Close(_) => return Termination::PeerClosed,
                        Message::Ping(_) | Message::Pong(_) => (),
                    }
                }
                _ = &mut deadline, if self.options.idle_timeout.is_some() => {
                    return Termination::IdleTimeout;
                }
                _ = ping.tick(), if self.options.ping_interval.is_some() => {
                    // a peer that stopped reading can hold the ping, so the
                    // deadline and the shutdown token stay armed meanwhile.
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Termination::Shutdown,
                        _ = &mut deadline, if self.options.idle_timeout.is_some() => {
                            return Termination::IdleTimeout;
                        }
                        result = conn.ping() => {
                            if let Err(e) = result {
                                log::debug!("keepalive ping failed: id={id}, error={e}");
                            }
                        }
                    }
                }
            }
        }
    }

    fn advance(&mut self, next: State) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid session transition: {:?} -> {next:?}",
            self.state
        );

        log::trace!("session state: addr={:?}, {:?} -> {next:?}", self.addr, self.state);
        self.state = next;
    }
}
