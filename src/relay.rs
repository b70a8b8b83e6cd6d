use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use turn::{
    Error,
    auth::{AuthHandler, generate_auth_key},
    relay::relay_static::RelayAddressGeneratorStatic,
    server::{
        Server,
        config::{ConnConfig, ServerConfig},
    },
};
use webrtc_util::vnet::net::Net;

use crate::config::Turn;

/// Long-term credential check against the single configured user.
struct StaticCredential {
    username: String,
    key: Vec<u8>,
}

impl StaticCredential {
    fn new(options: &Turn) -> Self {
        Self {
            key: generate_auth_key(&options.username, &options.realm, &options.password),
            username: options.username.clone(),
        }
    }
}

impl AuthHandler for StaticCredential {
    fn auth_handle(
        &self,
        username: &str,
        realm: &str,
        src_addr: SocketAddr,
    ) -> Result<Vec<u8>, Error> {
        if username == self.username {
            return Ok(self.key.clone());
        }

        log::warn!("turn auth rejected: username={username:?}, realm={realm:?}, addr={src_addr}");
        Err(Error::ErrFakeErr)
    }
}

/// The NAT traversal relay.
///
/// The relay runs on its own udp socket and shares nothing with the
/// signaling side, it is only started and stopped from here.
pub struct Relay {
    server: Server,
    local_addr: SocketAddr,
}

impl Relay {
    pub async fn start(options: &Turn) -> Result<Self> {
        let socket = UdpSocket::bind(options.listen)
            .await
            .with_context(|| format!("failed to bind turn socket: {}", options.listen))?;
        let local_addr = socket.local_addr()?;

        let server = Server::new(ServerConfig {
            conn_configs: vec![ConnConfig {
                conn: Arc::new(socket),
                relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                    relay_address: options.relay_address,
                    address: options.listen.ip().to_string(),
                    net: Arc::new(Net::new(None)),
                }),
            }],
            realm: options.realm.clone(),
            auth_handler: Arc::new(StaticCredential::new(options)),
            // zero selects the library default.
            channel_bind_timeout: Duration::from_secs(0),
            alloc_close_notify: None,
        })
        .await
        .context("failed to start turn server")?;

        log::info!(
            "turn server listening: listen={local_addr}, realm={}, relay address={}, username={}",
            options.realm,
            options.relay_address,
            options.username,
        );

        Ok(Self { server, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(&self) -> Result<()> {
        self.server.close().await?;
        log::info!("turn server closed: listen={}", self.local_addr);
        Ok(())
    }
}
