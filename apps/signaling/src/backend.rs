//! Client for the web backend that owns users and rooms.
//!
//! The backend validates hello v1 credentials, authorises room joins, and is
//! notified when sessions join, leave, or ping a room. Every request is a
//! POST whose body is authenticated with an HMAC-SHA256 checksum over a
//! random nonce plus the body, using the shared backend secret.
//!
//! Backed by HTTP in production and an in-memory implementation in tests and
//! single-node development setups.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::auth::hex_encode;
use crate::permissions::Permission;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_BACKEND_RANDOM: &str = "Spreed-Signaling-Random";
pub const HEADER_BACKEND_CHECKSUM: &str = "Spreed-Signaling-Checksum";

/// Length of the random nonce included in each signed request.
const REQUEST_RANDOM_LEN: usize = 64;

#[derive(Debug)]
pub enum BackendError {
    /// The transport failed (connect, timeout, i/o).
    Http(reqwest::Error),
    /// The backend answered with an unexpected HTTP status.
    Status(u16),
    /// The backend answered something that could not be interpreted.
    Invalid(String),
    /// The backend explicitly rejected the request.
    Rejected { code: String, message: String },
}

impl BackendError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(err) => write!(f, "backend request failed: {err}"),
            Self::Status(status) => write!(f, "backend returned status {status}"),
            Self::Invalid(msg) => write!(f, "invalid backend response: {msg}"),
            Self::Rejected { code, message } => write!(f, "backend rejected: {code} ({message})"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err)
    }
}

/// Result of validating hello v1 auth params.
#[derive(Debug, Clone, Default)]
pub struct AuthResponse {
    /// Authenticated user id; `None` for anonymous guests.
    pub user_id: Option<String>,
    /// Opaque user blob forwarded to room events.
    pub user: Option<Value>,
}

/// Result of authorising a room join.
#[derive(Debug, Clone, Default)]
pub struct RoomResponse {
    /// Opaque room properties from the backend.
    pub properties: Option<Value>,
    /// Permissions to assign to the joining session, if restricted.
    pub permissions: Option<Vec<Permission>>,
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Validate the `auth.params` of a hello v1 request.
    async fn validate_auth(
        &self,
        backend_url: &str,
        params: &Value,
    ) -> Result<AuthResponse, BackendError>;

    /// Ask the backend to authorise `user_id` joining `room_id` and return
    /// the room properties.
    async fn join_room(
        &self,
        backend_url: &str,
        room_id: &str,
        user_id: Option<&str>,
        room_session_id: Option<&str>,
    ) -> Result<RoomResponse, BackendError>;

    /// Notify the backend that room sessions left the room.
    async fn leave_room(
        &self,
        backend_url: &str,
        room_id: &str,
        room_session_ids: &[String],
    ) -> Result<(), BackendError>;

    /// Keep-alive ping for active room sessions.
    async fn ping_room(
        &self,
        backend_url: &str,
        room_id: &str,
        room_session_ids: &[String],
    ) -> Result<(), BackendError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BackendReply {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    auth: Option<AuthReply>,
    #[serde(default)]
    room: Option<RoomReply>,
    #[serde(default)]
    error: Option<crate::error::Error>,
}

#[derive(Debug, Deserialize)]
struct AuthReply {
    #[serde(default)]
    userid: Option<String>,
    #[serde(default)]
    user: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RoomReply {
    #[serde(default)]
    properties: Option<Value>,
    #[serde(default)]
    permissions: Option<Vec<Permission>>,
}

pub struct HttpBackend {
    http: reqwest::Client,
    secret: Vec<u8>,
}

impl HttpBackend {
    pub fn new(secret: &[u8], timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            secret: secret.to_vec(),
        })
    }

    /// Compute the checksum header value for a request body.
    pub fn checksum(secret: &[u8], random: &str, body: &[u8]) -> String {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key");
        mac.update(random.as_bytes());
        mac.update(body);
        hex_encode(&mac.finalize().into_bytes())
    }

    async fn request(&self, backend_url: &str, body: Value) -> Result<BackendReply, BackendError> {
        let body = serde_json::to_vec(&body)
            .map_err(|err| BackendError::Invalid(format!("could not encode request: {err}")))?;
        let random = chorus_common::id::random_string(REQUEST_RANDOM_LEN);
        let checksum = Self::checksum(&self.secret, &random, &body);

        let response = self
            .http
            .post(backend_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_BACKEND_RANDOM, &random)
            .header(HEADER_BACKEND_CHECKSUM, &checksum)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }

        let reply: BackendReply = response
            .json()
            .await
            .map_err(|err| BackendError::Invalid(format!("could not decode response: {err}")))?;

        if reply.kind == "error" {
            let error = reply
                .error
                .unwrap_or_else(crate::error::Error::server_error);
            return Err(BackendError::rejected(error.code, error.message));
        }
        Ok(reply)
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn validate_auth(
        &self,
        backend_url: &str,
        params: &Value,
    ) -> Result<AuthResponse, BackendError> {
        let reply = self
            .request(backend_url, json!({"type": "auth", "auth": {"params": params}}))
            .await?;
        let auth = reply
            .auth
            .ok_or_else(|| BackendError::Invalid("auth payload missing".to_string()))?;
        Ok(AuthResponse {
            user_id: auth.userid.filter(|id| !id.is_empty()),
            user: auth.user,
        })
    }

    async fn join_room(
        &self,
        backend_url: &str,
        room_id: &str,
        user_id: Option<&str>,
        room_session_id: Option<&str>,
    ) -> Result<RoomResponse, BackendError> {
        let reply = self
            .request(
                backend_url,
                json!({
                    "type": "room",
                    "room": {
                        "roomid": room_id,
                        "userid": user_id,
                        "sessionid": room_session_id,
                        "action": "join",
                    }
                }),
            )
            .await?;
        let room = reply
            .room
            .ok_or_else(|| BackendError::Invalid("room payload missing".to_string()))?;
        Ok(RoomResponse {
            properties: room.properties,
            permissions: room.permissions,
        })
    }

    async fn leave_room(
        &self,
        backend_url: &str,
        room_id: &str,
        room_session_ids: &[String],
    ) -> Result<(), BackendError> {
        self.request(
            backend_url,
            json!({
                "type": "room",
                "room": {
                    "roomid": room_id,
                    "sessionids": room_session_ids,
                    "action": "leave",
                }
            }),
        )
        .await?;
        Ok(())
    }

    async fn ping_room(
        &self,
        backend_url: &str,
        room_id: &str,
        room_session_ids: &[String],
    ) -> Result<(), BackendError> {
        self.request(
            backend_url,
            json!({
                "type": "room",
                "room": {
                    "roomid": room_id,
                    "sessionids": room_session_ids,
                    "action": "ping",
                }
            }),
        )
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Backend that accepts any hello whose params carry a `userid`, and any
/// room not explicitly denied.
#[derive(Default)]
pub struct MemoryBackend {
    denied_rooms: Mutex<HashSet<String>>,
    room_properties: Mutex<HashMap<String, Value>>,
    left_rooms: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_room(&self, room_id: &str) {
        self.denied_rooms.lock().insert(room_id.to_string());
    }

    pub fn set_room_properties(&self, room_id: &str, properties: Value) {
        self.room_properties
            .lock()
            .insert(room_id.to_string(), properties);
    }

    /// Rooms the backend was told sessions left, in call order.
    pub fn left_rooms(&self) -> Vec<(String, Vec<String>)> {
        self.left_rooms.lock().clone()
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    async fn validate_auth(
        &self,
        _backend_url: &str,
        params: &Value,
    ) -> Result<AuthResponse, BackendError> {
        match params.get("userid").and_then(Value::as_str) {
            Some(user_id) if !user_id.is_empty() => Ok(AuthResponse {
                user_id: Some(user_id.to_string()),
                user: params.get("user").cloned(),
            }),
            _ => Err(BackendError::rejected("auth_failed", "unknown user")),
        }
    }

    async fn join_room(
        &self,
        _backend_url: &str,
        room_id: &str,
        _user_id: Option<&str>,
        _room_session_id: Option<&str>,
    ) -> Result<RoomResponse, BackendError> {
        if self.denied_rooms.lock().contains(room_id) {
            return Err(BackendError::rejected("room_join_failed", "not invited"));
        }
        let properties = self
            .room_properties
            .lock()
            .get(room_id)
            .cloned()
            .or_else(|| Some(json!({"name": room_id})));
        Ok(RoomResponse {
            properties,
            permissions: None,
        })
    }

    async fn leave_room(
        &self,
        _backend_url: &str,
        room_id: &str,
        room_session_ids: &[String],
    ) -> Result<(), BackendError> {
        self.left_rooms
            .lock()
            .push((room_id.to_string(), room_session_ids.to_vec()));
        Ok(())
    }

    async fn ping_room(
        &self,
        _backend_url: &str,
        _room_id: &str,
        _room_session_ids: &[String],
    ) -> Result<(), BackendError> {
        Ok(())
    }
}
