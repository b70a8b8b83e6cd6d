use std::{
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// signaling server listen
    ///
    /// The address and port the http server is bound to. The websocket
    /// upgrade endpoint and the static files are both served from here.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
    ///
    /// websocket upgrade path
    ///
    #[serde(default = "Server::path")]
    pub path: String,
    ///
    /// Directory of the static assets served at the root path.
    ///
    #[serde(default = "Server::static_dir")]
    pub static_dir: String,
    ///
    /// Maximum number of threads the signaling server can use.
    ///
    #[serde(default = "Server::max_threads")]
    pub max_threads: usize,
    ///
    /// Shutdown grace period
    ///
    /// When the process is asked to stop, connections get this many seconds
    /// to finish their teardown before they are closed forcibly.
    ///
    #[serde(default = "Server::shutdown_grace")]
    pub shutdown_grace: u64,
    ///
    /// The maximum size of a single websocket message, in bytes.
    ///
    /// A frame above this size is a transport error and closes the
    /// connection of the peer that sent it.
    ///
    #[serde(default = "Server::max_message_size")]
    pub max_message_size: usize,
    ///
    /// Idle timeout
    ///
    /// If no frame is received within the specified number of seconds, the
    /// connection is considered dead and torn down. Zero disables the check.
    ///
    #[serde(default = "Server::idle_timeout")]
    pub idle_timeout: u64,
    ///
    /// Interval, in seconds, of the keepalive pings sent to every peer. Zero
    /// disables the pings.
    ///
    #[serde(default = "Server::ping_interval")]
    pub ping_interval: u64,
}

impl Server {
    fn listen() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
    }

    fn path() -> String {
        "/websocket".to_string()
    }

    fn static_dir() -> String {
        ".".to_string()
    }

    fn max_threads() -> usize {
        num_cpus::get()
    }

    fn shutdown_grace() -> u64 {
        10
    }

    fn max_message_size() -> usize {
        64 << 20
    }

    fn idle_timeout() -> u64 {
        60
    }

    fn ping_interval() -> u64 {
        20
    }

    pub fn get_shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }

    pub fn get_idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }

    pub fn get_ping_interval(&self) -> Option<Duration> {
        (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            path: Self::path(),
            static_dir: Self::static_dir(),
            max_threads: Self::max_threads(),
            shutdown_grace: Self::shutdown_grace(),
            max_message_size: Self::max_message_size(),
            idle_timeout: Self::idle_timeout(),
            ping_interval: Self::ping_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Turn {
    ///
    /// Whether the embedded turn server is started at all.
    ///
    #[serde(default = "Turn::enabled")]
    pub enabled: bool,
    ///
    /// turn server listen
    ///
    /// The udp address and port the turn server is bound to.
    ///
    #[serde(default = "Turn::listen")]
    pub listen: SocketAddr,
    ///
    /// relay address
    ///
    /// The address advertised to clients as the relayed transport address.
    /// When the server is exposed to the outside, this must be the external
    /// ip address of the host.
    ///
    #[serde(default = "Turn::relay_address")]
    pub relay_address: IpAddr,
    ///
    /// turn server realm
    ///
    /// specify the domain where the server is located.
    ///
    #[serde(default = "Turn::realm")]
    pub realm: String,
    ///
    /// static user name
    ///
    #[serde(default = "Turn::username")]
    pub username: String,
    ///
    /// static user password
    ///
    #[serde(default = "Turn::password")]
    pub password: String,
}

impl Turn {
    fn enabled() -> bool {
        true
    }

    fn listen() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3478))
    }

    fn relay_address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn realm() -> String {
        "localhost".to_string()
    }

    fn username() -> String {
        "peer".to_string()
    }

    fn password() -> String {
        "peer".to_string()
    }
}

impl Default for Turn {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
            listen: Self::listen(),
            relay_address: Self::relay_address(),
            realm: Self::realm(),
            username: Self::username(),
            password: Self::password(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub turn: Turn,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: signaling-server --config /etc/signaling-server/config.json5
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is read
    /// from the configuration file, otherwise the default configuration is
    /// used.
    ///
    pub fn load() -> Result<Self> {
        match Cli::parse().config {
            Some(path) => {
                let text = read_to_string(&path)
                    .with_context(|| format!("failed to read config file: {path}"))?;

                Self::from_json5(&text)
            }
            None => Ok(Self::default()),
        }
    }

    /// # Example
    ///
    /// ```
    /// use signaling_server::config::{Config, LogLevel};
    ///
    /// let config = Config::from_json5(r#"{
    ///     server: { listen: "127.0.0.1:9000" },
    ///     turn: { realm: "example.com" },
    ///     log: { level: "debug" },
    /// }"#).unwrap();
    ///
    /// assert_eq!(config.server.listen, "127.0.0.1:9000".parse().unwrap());
    /// assert_eq!(config.server.path, "/websocket");
    /// assert_eq!(config.turn.realm, "example.com");
    /// assert_eq!(config.turn.username, "peer");
    /// assert_eq!(config.log.level, LogLevel::Debug);
    /// ```
    pub fn from_json5(text: &str) -> Result<Self> {
        Ok(serde_json5::from_str::<Self>(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_json5("{}").unwrap();

        assert_eq!(config.server.listen, Server::listen());
        assert_eq!(config.server.shutdown_grace, 10);
        assert_eq!(config.turn.listen.port(), 3478);
        assert_eq!(config.turn.password, "peer");
        assert_eq!(config.log.level, LogLevel::Info);
    }

    #[test]
    fn zero_disables_heartbeat() {
        let config = Config::from_json5(
            r#"{ server: { "idle-timeout": 0, "ping-interval": 0 } }"#,
        )
        .unwrap();

        assert_eq!(config.server.get_idle_timeout(), None);
        assert_eq!(config.server.get_ping_interval(), None);
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!(Config::from_json5(r#"{ log: { level: "verbose" } }"#).is_err());
    }
}
