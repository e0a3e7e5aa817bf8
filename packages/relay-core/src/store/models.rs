use serde::{Deserialize, Serialize};

/// Identity with a unique bearer `api_token`. Password/session handling is an
/// external collaborator's concern; the relay only ever resolves a token to
/// a user row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub api_token: String,
    pub plan: String,
    pub devices_limit: i64,
    pub created_at: i64,
}

/// Device owned by exactly one `User`. `device_token` is opaque to the relay
/// — endpoints use it for payload crypto, never for relay-level auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub user_id: String,
    pub device_token: String,
    pub cloud: bool,
    pub added: i64,
    pub last_seen: Option<i64>,
    pub poll_count: i64,
    pub last_request_counter: i64,
}

impl Device {
    /// Online iff `last_seen` falls inside the presence window. Stream
    /// presence is a separate, connection-registry-backed signal — combine
    /// both at the call site.
    pub fn seen_recently(&self, now: i64) -> bool {
        match self.last_seen {
            Some(t) => now - t < crate::PRESENCE_WINDOW_SECS,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToDevice,
    ToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToDevice => "to_device",
            Direction::ToClient => "to_client",
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Direction::ToDevice => MessageType::Command,
            Direction::ToClient => MessageType::Response,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "to_device" => Some(Direction::ToDevice),
            "to_client" => Some(Direction::ToClient),
            _ => None,
        }
    }
}

/// A queued packet. `direction=to_device ⇔ message_type=command` and
/// `direction=to_client ⇔ message_type=response` are enforced by always
/// deriving `message_type` from `direction` (see `Direction::message_type`)
/// rather than accepting it independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: i64,
    pub device_id: String,
    pub device_token: Option<String>,
    pub message_type: MessageType,
    pub message_data: String,
    pub signature: Option<String>,
    pub direction: Direction,
    pub timestamp: i64,
}
