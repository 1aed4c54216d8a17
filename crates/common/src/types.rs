// Common types for the VPN client daemon

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a profile's tunnel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProfileState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ProfileState {
    /// A tunnel subprocess may be alive in this state
    pub fn is_active(&self) -> bool {
        !matches!(self, ProfileState::Disconnected)
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// `Disconnecting -> Disconnected` is the only way back to rest; an
    /// unexpected exit goes through `Disconnecting` first.
    pub fn can_transition_to(&self, next: ProfileState) -> bool {
        use ProfileState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl std::fmt::Display for ProfileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProfileState::Disconnected => "Disconnected",
            ProfileState::Connecting => "Connecting",
            ProfileState::Connected => "Connected",
            ProfileState::Disconnecting => "Disconnecting",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one profile
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileSnapshot {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: ProfileState,
    /// Unix seconds at which the tunnel reached `Connected`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<String>,
    /// Reason for the last failure, if the tunnel went down on its own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a `state` event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChange {
    pub profile: String,
    pub state: ProfileState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_addr: Option<String>,
}

impl StateChange {
    pub fn from_snapshot(snapshot: &ProfileSnapshot) -> Self {
        Self {
            profile: snapshot.id.clone(),
            state: snapshot.state,
            error: snapshot.error.clone(),
            timestamp: snapshot.timestamp,
            server_addr: snapshot.server_addr.clone(),
            client_addr: snapshot.client_addr.clone(),
        }
    }
}

/// Event payloads, keyed by the wire `type` tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    /// A profile changed state
    State(StateChange),
    /// One line of tunnel subprocess output
    Output { profile: String, output: String },
    /// The tunnel rejected the profile's credentials
    AuthError { profile: String },
    /// The tunnel did not finish connecting within the connect timeout
    TimeoutError { profile: String },
    /// Another UI instance wants the running one to show itself
    Wakeup,
}

impl EventKind {
    /// Wire name of the `type` tag
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::State(_) => "state",
            EventKind::Output { .. } => "output",
            EventKind::AuthError { .. } => "auth_error",
            EventKind::TimeoutError { .. } => "timeout_error",
            EventKind::Wakeup => "wakeup",
        }
    }
}

/// Immutable notification distributed to every listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Build an event with a fresh random identifier
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }
}

/// Aggregate status returned by `GET /status`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: bool,
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert a unix-millisecond value back to a UTC timestamp
pub fn from_unix_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}
