//! Room events, presence payloads and the relay wire frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::room::{ClaimRequest, RoomState};

/// Events exchanged between clients of one room channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum RoomEvent {
    /// Host to all: the full document.
    State(RoomState),
    /// Player to host: please re-announce.
    RequestState { requester: String },
    /// Player to host: a win claim awaiting verification.
    ClaimBingo(ClaimRequest),
}

impl RoomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::State(_) => "state",
            RoomEvent::RequestState { .. } => "request_state",
            RoomEvent::ClaimBingo(_) => "claim_bingo",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Player,
}

/// What a connection tracks in the channel roster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PresenceMeta {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub online_at: DateTime<Utc>,
}

impl PresenceMeta {
    pub fn new(role: Role, username: Option<String>) -> Self {
        Self {
            role,
            username,
            online_at: Utc::now(),
        }
    }
}

/// Presence key to every tracked connection under that key.
pub type Roster = BTreeMap<String, Vec<PresenceMeta>>;

/// Frames sent from a client to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "msgType")]
pub enum ClientFrame {
    /// Subscribe this connection to `channel` under `presence_key`.
    Join { channel: String, presence_key: String },
    /// Publish presence metadata for this connection.
    Track { meta: PresenceMeta },
    /// Relay an event to every other member of the channel.
    Broadcast { event: RoomEvent },
    Leave,
}

/// Frames sent from the relay to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "msgType")]
pub enum ServerFrame {
    Subscribed { channel: String },
    Broadcast { event: RoomEvent },
    PresenceSync { roster: Roster },
    Error { code: String, message: String },
}
