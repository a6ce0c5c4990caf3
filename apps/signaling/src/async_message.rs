//! Envelope for events exchanged between server instances.
//!
//! Exactly one payload slot is populated per envelope; receivers dispatch on
//! `type`. A single instance still routes through these envelopes via the
//! in-process loopback transport, so the cross-node path is always exercised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::ServerMessage;
use crate::permissions::Permission;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsyncMessage {
    pub sendtime: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<BackendRoomRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionsMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asyncroom: Option<AsyncRoomMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sendoffer: Option<SendOfferMessage>,
    pub id: String,
}

impl AsyncMessage {
    fn new(kind: &str) -> Self {
        Self {
            sendtime: Utc::now(),
            kind: kind.to_string(),
            id: chorus_common::id::random_token(16),
            ..Default::default()
        }
    }

    pub fn message(message: ServerMessage) -> Self {
        Self {
            message: Some(message),
            ..Self::new("message")
        }
    }

    pub fn room(room: BackendRoomRequest) -> Self {
        Self {
            room: Some(room),
            ..Self::new("room")
        }
    }

    pub fn permissions(permissions: PermissionsMessage) -> Self {
        Self {
            permissions: Some(permissions),
            ..Self::new("permissions")
        }
    }

    pub fn asyncroom(asyncroom: AsyncRoomMessage) -> Self {
        Self {
            asyncroom: Some(asyncroom),
            ..Self::new("asyncroom")
        }
    }

    pub fn sendoffer(sendoffer: SendOfferMessage) -> Self {
        Self {
            sendoffer: Some(sendoffer),
            ..Self::new("sendoffer")
        }
    }
}

impl std::fmt::Display for AsyncMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(data) => f.write_str(&data),
            Err(err) => write!(f, "could not serialize {self:?}: {err}"),
        }
    }
}

/// A room-level request originating from the backend, forwarded between
/// instances so every hub serving the room applies it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendRoomRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub roomid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend_url: String,
    /// New room properties for `update`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    /// Affected user ids for `disinvite`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userids: Option<Vec<String>>,
    /// New in-call flags for `incall`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incall: Option<u32>,
    /// Affected public session ids for `incall`; absent means every session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessionids: Option<Vec<String>>,
    /// Opaque payload for `message`, delivered to the room as an event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsMessage {
    pub sessionid: String,
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsyncRoomMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sessionid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub clienttype: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOfferMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub messageid: String,
    pub sessionid: String,
    pub data: Value,
}
