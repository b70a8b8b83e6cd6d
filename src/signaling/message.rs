use std::{fmt, str::FromStr};

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event sent to a peer right after the upgrade, carrying its identifier.
pub const WELCOME: &str = "welcome";

/// Event carrying the serialized presence list.
pub const PEERS: &str = "peers";

/// Server assigned peer identifier.
///
/// The identifier is generated by the server at connect time and is never
/// taken from the client.
///
/// # Example
///
/// ```
/// use signaling_server::signaling::PeerId;
///
/// let id = PeerId::generate();
/// assert_ne!(id, PeerId::generate());
/// assert_eq!(id.to_string().parse::<PeerId>().unwrap(), id);
/// assert!("not-an-id".parse::<PeerId>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value)
            .map(Self)
            .map_err(|e| anyhow!("invalid peer id {value:?}: {e}"))
    }
}

/// The message unit exchanged between the server and a peer.
///
/// On the wire this is a json object, the optional fields are omitted when
/// they are absent. Unknown fields are a schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl Envelope {
    pub fn welcome(id: &PeerId) -> Self {
        Self {
            event: WELCOME.to_string(),
            data: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn peers(entries: &[PresenceEntry]) -> Result<Self> {
        Ok(Self {
            event: PEERS.to_string(),
            data: Some(serde_json::to_string(entries)?),
            ..Default::default()
        })
    }

    /// Decode a frame sent by a peer.
    ///
    /// Besides the json schema, a peer is not allowed to use the events that
    /// are reserved for the server, or an empty event.
    ///
    /// # Example
    ///
    /// ```
    /// use signaling_server::signaling::Envelope;
    ///
    /// let envelope = Envelope::decode(r#"{"event":"offer","data":"sdp","to":"x"}"#).unwrap();
    /// assert_eq!(envelope.event, "offer");
    /// assert_eq!(envelope.to.as_deref(), Some("x"));
    ///
    /// assert!(Envelope::decode("{").is_err());
    /// assert!(Envelope::decode(r#"{"event":"welcome"}"#).is_err());
    /// assert!(Envelope::decode(r#"{"event":"offer","extra":1}"#).is_err());
    /// ```
    pub fn decode(raw: &str) -> Result<Self> {
        let envelope = serde_json::from_str::<Self>(raw)?;
        match envelope.event.as_str() {
            "" => Err(anyhow!("empty event")),
            WELCOME | PEERS => Err(anyhow!("reserved event: {}", envelope.event)),
            _ => Ok(envelope),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The addressed peer, if any. An empty string counts as absent.
    pub fn recipient(&self) -> Option<&str> {
        self.to.as_deref().filter(|it| !it.is_empty())
    }
}

/// One item of a presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub id: PeerId,
    #[serde(rename = "connectedAt", serialize_with = "rfc3339")]
    pub connected_at: DateTime<Utc>,
}

fn rfc3339<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
}
