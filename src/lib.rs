pub mod config;
pub mod relay;
pub mod server;
pub mod signaling;

use self::{
    config::Config,
    relay::Relay,
    server::Server,
    signaling::{SessionOptions, Signaling},
};

use tokio_util::sync::CancellationToken;

/// In order to let the integration test directly use the signaling-server
/// crate and start the server, a function is opened to replace the main
/// function to directly start the server.
///
/// Returns once the server was shut down by a termination signal.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let relay = if config.turn.enabled {
        Some(Relay::start(&config.turn).await?)
    } else {
        log::warn!("turn server is disabled, peers behind symmetric nat will not connect");
        None
    };

    let shutdown = CancellationToken::new();
    let signaling = Signaling::new(
        SessionOptions {
            idle_timeout: config.server.get_idle_timeout(),
            ping_interval: config.server.get_ping_interval(),
        },
        shutdown.clone(),
    );

    let server = Server::bind(&config.server, signaling).await?;
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("termination signal received");
        shutdown.cancel();
    });

    let result = server.run().await;

    if let Some(relay) = relay {
        if let Err(e) = relay.close().await {
            log::error!("failed to close turn server: error={e}");
        }
    }

    result
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: error={e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut it) => {
                it.recv().await;
            }
            Err(e) => {
                log::error!("failed to listen for sigterm: error={e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    }
}
