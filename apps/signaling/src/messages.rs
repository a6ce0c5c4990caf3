//! Wire-format messages exchanged with clients over the `/spreed` socket.
//!
//! Both directions use a single JSON envelope with a `type` discriminator and
//! one sibling payload field named after the type. Payload structs derive both
//! `Serialize` and `Deserialize` so the integration-test client can reuse
//! them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Maximum size of an incoming text frame in bytes.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Features advertised in the `welcome` message and hello responses.
pub const SERVER_FEATURES: &[&str] = &[
    "hello-v2",
    "incall-all",
    "switchto",
    "transient-data",
    "welcome",
];

pub const HELLO_VERSION_V1: &str = "1.0";
pub const HELLO_VERSION_V2: &str = "2.0";

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hello: Option<HelloClientMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bye: Option<ByeClientMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomClientMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageClientMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlClientMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal: Option<InternalClientMessage>,
    #[serde(rename = "transientdata", skip_serializing_if = "Option::is_none")]
    pub transient_data: Option<TransientDataClientMessage>,
}

impl ClientMessage {
    /// Validate that the payload matching `type` is present and well-formed.
    pub fn check_valid(&self) -> Result<(), Error> {
        match self.kind.as_str() {
            "hello" => match &self.hello {
                Some(hello) => hello.check_valid(),
                None => Err(Error::invalid_message("hello payload missing")),
            },
            "bye" => Ok(()),
            "room" => match &self.room {
                Some(_) => Ok(()),
                None => Err(Error::invalid_message("room payload missing")),
            },
            "message" => match &self.message {
                Some(message) => message.check_valid(),
                None => Err(Error::invalid_message("message payload missing")),
            },
            "control" => match &self.control {
                Some(control) => control.message.check_valid(),
                None => Err(Error::invalid_message("control payload missing")),
            },
            "internal" => match &self.internal {
                Some(_) => Ok(()),
                None => Err(Error::invalid_message("internal payload missing")),
            },
            "transient" => match &self.transient_data {
                Some(transient) => transient.check_valid(),
                None => Err(Error::invalid_message("transient payload missing")),
            },
            other => Err(Error::invalid_message(format!(
                "unsupported message type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloClientMessage {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumeid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloClientMessageAuth>,
}

impl HelloClientMessage {
    pub fn check_valid(&self) -> Result<(), Error> {
        if self.version != HELLO_VERSION_V1 && self.version != HELLO_VERSION_V2 {
            return Err(Error::invalid_hello_version());
        }
        if self.resumeid.is_none() && self.auth.is_none() {
            return Err(Error::invalid_message("hello requires auth or resumeid"));
        }
        if let Some(auth) = &self.auth {
            if auth.client_type != "internal" && auth.url.is_empty() {
                return Err(Error::invalid_message("auth backend url missing"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloClientMessageAuth {
    /// Empty or "client" for regular clients, "internal" for gateways.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub client_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ByeClientMessage {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomClientMessage {
    /// Empty to leave the current room without joining another.
    #[serde(default)]
    pub roomid: String,
    /// Backend-scoped room session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessionid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageClientMessage {
    pub recipient: MessageClientMessageRecipient,
    pub data: Value,
}

impl MessageClientMessage {
    pub fn check_valid(&self) -> Result<(), Error> {
        match self.recipient.recipient_type.as_str() {
            "session" => match &self.recipient.sessionid {
                Some(id) if !id.is_empty() => Ok(()),
                _ => Err(Error::invalid_message("recipient session id missing")),
            },
            "user" => match &self.recipient.userid {
                Some(id) if !id.is_empty() => Ok(()),
                _ => Err(Error::invalid_message("recipient user id missing")),
            },
            "room" | "call" => Ok(()),
            other => Err(Error::invalid_message(format!(
                "unsupported recipient type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageClientMessageRecipient {
    #[serde(rename = "type")]
    pub recipient_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessionid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlClientMessage {
    #[serde(flatten)]
    pub message: MessageClientMessage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incall: Option<InCallInternalClientMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InCallInternalClientMessage {
    pub incall: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransientDataClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Time-to-live in nanoseconds; 0 or absent means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl TransientDataClientMessage {
    pub fn check_valid(&self) -> Result<(), Error> {
        match self.kind.as_str() {
            "set" | "remove" => match &self.key {
                Some(key) if !key.is_empty() => Ok(()),
                _ => Err(Error::invalid_message("transient key missing")),
            },
            other => Err(Error::invalid_message(format!(
                "unsupported transient type {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub welcome: Option<WelcomeServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hello: Option<HelloServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bye: Option<ByeServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<MessageServerMessage>,
    #[serde(rename = "transientdata", skip_serializing_if = "Option::is_none")]
    pub transient_data: Option<TransientDataServerMessage>,
}

impl ServerMessage {
    pub fn welcome() -> Self {
        Self {
            kind: "welcome".to_string(),
            welcome: Some(WelcomeServerMessage::default()),
            ..Default::default()
        }
    }

    pub fn hello(id: Option<String>, hello: HelloServerMessage) -> Self {
        Self {
            id,
            kind: "hello".to_string(),
            hello: Some(hello),
            ..Default::default()
        }
    }

    pub fn bye(id: Option<String>, reason: Option<String>) -> Self {
        Self {
            id,
            kind: "bye".to_string(),
            bye: Some(ByeServerMessage { reason }),
            ..Default::default()
        }
    }

    pub fn error(id: Option<String>, error: Error) -> Self {
        Self {
            id,
            kind: "error".to_string(),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn room(id: Option<String>, roomid: String, properties: Option<Value>) -> Self {
        Self {
            id,
            kind: "room".to_string(),
            room: Some(RoomServerMessage { roomid, properties }),
            ..Default::default()
        }
    }

    pub fn event(event: EventServerMessage) -> Self {
        Self {
            kind: "event".to_string(),
            event: Some(event),
            ..Default::default()
        }
    }

    pub fn message(sender: MessageServerMessageSender, data: Value) -> Self {
        Self {
            kind: "message".to_string(),
            message: Some(MessageServerMessage {
                sender,
                recipient: None,
                data,
            }),
            ..Default::default()
        }
    }

    pub fn control(sender: MessageServerMessageSender, data: Value) -> Self {
        Self {
            kind: "control".to_string(),
            control: Some(MessageServerMessage {
                sender,
                recipient: None,
                data,
            }),
            ..Default::default()
        }
    }

    pub fn transient(transient: TransientDataServerMessage) -> Self {
        Self {
            kind: "transient".to_string(),
            transient_data: Some(transient),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeServerMessage {
    pub version: String,
    pub features: Vec<String>,
}

impl Default for WelcomeServerMessage {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            features: SERVER_FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloServerMessage {
    pub version: String,
    pub sessionid: String,
    pub resumeid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub userid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<WelcomeServerMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ByeServerMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomServerMessage {
    pub roomid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventServerMessage {
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
    // target "room"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<Vec<EventServerMessageSessionEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<RoomEventMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switchto: Option<EventServerMessageSwitchTo>,
    // targets "roomlist" and "participants"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<RoomEventServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disinvite: Option<RoomDisinviteEventServerMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<RoomFlagsServerMessage>,
}

impl EventServerMessage {
    pub fn room_join(entries: Vec<EventServerMessageSessionEntry>) -> Self {
        Self {
            target: "room".to_string(),
            kind: "join".to_string(),
            join: Some(entries),
            ..Default::default()
        }
    }

    pub fn room_leave(session_ids: Vec<String>) -> Self {
        Self {
            target: "room".to_string(),
            kind: "leave".to_string(),
            leave: Some(session_ids),
            ..Default::default()
        }
    }

    pub fn room_message(roomid: String, data: Value) -> Self {
        Self {
            target: "room".to_string(),
            kind: "message".to_string(),
            message: Some(RoomEventMessage { roomid, data }),
            ..Default::default()
        }
    }

    pub fn room_switchto(roomid: String, details: Option<Value>) -> Self {
        Self {
            target: "room".to_string(),
            kind: "switchto".to_string(),
            switchto: Some(EventServerMessageSwitchTo { roomid, details }),
            ..Default::default()
        }
    }

    pub fn participants_update(update: RoomEventServerMessage) -> Self {
        Self {
            target: "participants".to_string(),
            kind: "update".to_string(),
            update: Some(update),
            ..Default::default()
        }
    }

    pub fn participants_flags(flags: RoomFlagsServerMessage) -> Self {
        Self {
            target: "participants".to_string(),
            kind: "flags".to_string(),
            flags: Some(flags),
            ..Default::default()
        }
    }

    pub fn roomlist_update(update: RoomEventServerMessage) -> Self {
        Self {
            target: "roomlist".to_string(),
            kind: "update".to_string(),
            update: Some(update),
            ..Default::default()
        }
    }

    pub fn roomlist_disinvite(disinvite: RoomDisinviteEventServerMessage) -> Self {
        Self {
            target: "roomlist".to_string(),
            kind: "disinvite".to_string(),
            disinvite: Some(disinvite),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventServerMessageSessionEntry {
    pub sessionid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub userid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roomsessionid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomEventServerMessage {
    pub roomid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incall: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomDisinviteEventServerMessage {
    pub roomid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomEventMessage {
    pub roomid: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventServerMessageSwitchTo {
    pub roomid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomFlagsServerMessage {
    pub roomid: String,
    pub sessionid: String,
    pub incall: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageServerMessage {
    pub sender: MessageServerMessageSender,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<MessageClientMessageRecipient>,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageServerMessageSender {
    #[serde(rename = "type")]
    pub sender_type: String,
    pub sessionid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub userid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransientDataServerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldvalue: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, Value>>,
}

impl TransientDataServerMessage {
    pub fn set(key: String, value: Value, old_value: Option<Value>) -> Self {
        Self {
            kind: "set".to_string(),
            key: Some(key),
            value: Some(value),
            oldvalue: old_value,
            data: None,
        }
    }

    pub fn remove(key: String, old_value: Option<Value>) -> Self {
        Self {
            kind: "remove".to_string(),
            key: Some(key),
            value: None,
            oldvalue: old_value,
            data: None,
        }
    }

    pub fn initial(data: serde_json::Map<String, Value>) -> Self {
        Self {
            kind: "initial".to_string(),
            key: None,
            value: None,
            oldvalue: None,
            data: Some(data),
        }
    }
}
