use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use axum::{
    Router,
    extract::{ConnectInfo, State, ws::WebSocketUpgrade},
    response::Response,
    routing::get,
};
use futures::StreamExt;
use tokio::{net::TcpListener, time::timeout};
use tokio_util::task::TaskTracker;
use tower_http::services::ServeDir;

use crate::{config, signaling::Signaling};

// Time given to each connection once the grace period is over.
const FORCED_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct AppState {
    signaling: Signaling,
    tracker: TaskTracker,
    max_message_size: usize,
}

/// Hands upgraded transports over to a signaling session.
async fn upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = state.signaling.session(Some(addr));

    // held until the session is done, or dropped with the callback when the
    // upgrade fails.
    let tracked = state.tracker.token();

    ws.max_message_size(state.max_message_size)
        .on_failed_upgrade(move |e| {
            log::warn!("websocket upgrade failed: addr={addr}, error={e}");
        })
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            session.run(sink, stream).await;
            drop(tracked);
        })
}

/// The http side: the websocket endpoint plus the static files.
pub struct Server {
    listener: TcpListener,
    router: Router,
    signaling: Signaling,
    tracker: TaskTracker,
    grace: Duration,
}

impl Server {
    pub async fn bind(options: &config::Server, signaling: Signaling) -> Result<Self> {
        let tracker = TaskTracker::new();
        let router = Router::new()
            .route(&options.path, get(upgrade))
            .fallback_service(ServeDir::new(&options.static_dir))
            .with_state(AppState {
                signaling: signaling.clone(),
                tracker: tracker.clone(),
                max_message_size: options.max_message_size,
            });

        let listener = TcpListener::bind(options.listen).await?;
        log::info!(
            "signaling server listening: listen={}, path={}, static dir={}",
            listener.local_addr()?,
            options.path,
            options.static_dir,
        );

        Ok(Self {
            grace: options.get_shutdown_grace(),
            listener,
            router,
            signaling,
            tracker,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown token is cancelled.
    ///
    /// On shutdown the listener stops accepting, every session runs its own
    /// teardown, and whatever is still connected after the grace period is
    /// closed forcibly.
    pub async fn run(self) -> Result<()> {
        let token = self.signaling.shutdown_token().clone();
        let server = axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(token.clone().cancelled_owned());

        let mut serve = tokio::spawn(async move { server.await });
        let mut stopped = None;

        tokio::select! {
            result = &mut serve => stopped = Some(result),
            _ = token.cancelled() => (),
        }

        token.cancel();
        self.tracker.close();

        log::info!(
            "signaling server shutting down: peers={}, grace={:?}",
            self.signaling.registry().len(),
            self.grace
        );

        let drained = timeout(self.grace, async {
            if stopped.is_none() {
                stopped = Some((&mut serve).await);
            }

            self.tracker.wait().await;
        })
        .await;

        if drained.is_err() {
            let count = self.signaling.close_all(FORCED_CLOSE_TIMEOUT).await;
            log::warn!("shutdown grace period elapsed: forced close of {count} peers");
        }

        if stopped.is_none() {
            serve.abort();
        }

        log::info!("signaling server stopped");

        match stopped {
            Some(result) => Ok(result??),
            None => Ok(()),
        }
    }
}
