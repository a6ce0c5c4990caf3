//! An authenticated participant, persistent across brief disconnects.
//!
//! A session is created by a successful hello and outlives its socket: when
//! the client connection drops, the session stays resumable until the resume
//! window lapses. The hub owns the session tables; the session itself owns
//! its permission set, in-call flags, and pending outbound queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::{ClientHandle, SendError};
use crate::messages::{
    EventServerMessageSessionEntry, MessageServerMessageSender, ServerMessage,
};
use crate::permissions::{Permission, PermissionSet};

pub type SessionId = u64;

/// In-call bitfield values.
pub const FLAG_DISCONNECTED: u32 = 0;
pub const FLAG_IN_CALL: u32 = 1;
pub const FLAG_WITH_AUDIO: u32 = 2;
pub const FLAG_WITH_VIDEO: u32 = 4;
pub const FLAG_WITH_PHONE: u32 = 8;

/// Messages buffered for a detached session before it is closed as overloaded.
const MAX_PENDING_MESSAGES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Client,
    Internal,
    Federated,
    Virtual,
}

impl ClientType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Internal => "internal",
            Self::Federated => "federated",
            Self::Virtual => "virtual",
        }
    }
}

/// Result of handing a message to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued to the attached client or the pending buffer.
    Delivered,
    /// The outbound queue is full; the session must be closed as overloaded.
    Overflow,
    /// The session is already closed; the message was dropped.
    Closed,
}

struct SessionInner {
    client: Option<Arc<ClientHandle>>,
    room_id: Option<String>,
    room_session_id: Option<String>,
    permissions: PermissionSet,
    in_call: u32,
    pending: VecDeque<Arc<ServerMessage>>,
    detached_since: Option<Instant>,
    last_activity: Instant,
    closed: bool,
}

pub struct Session {
    id: SessionId,
    public_id: String,
    resume_id: String,
    client_type: ClientType,
    backend_url: String,
    user_id: Option<String>,
    user_data: Option<Value>,
    features: Vec<String>,
    inner: Mutex<SessionInner>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        public_id: String,
        resume_id: String,
        client_type: ClientType,
        backend_url: String,
        user_id: Option<String>,
        user_data: Option<Value>,
        features: Vec<String>,
        client: Arc<ClientHandle>,
    ) -> Self {
        Self {
            id,
            public_id,
            resume_id,
            client_type,
            backend_url,
            user_id,
            user_data,
            features,
            inner: Mutex::new(SessionInner {
                client: Some(client),
                room_id: None,
                room_session_id: None,
                permissions: PermissionSet::new(),
                in_call: FLAG_DISCONNECTED,
                pending: VecDeque::new(),
                detached_since: None,
                last_activity: Instant::now(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    pub fn resume_id(&self) -> &str {
        &self.resume_id
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn user_data(&self) -> Option<&Value> {
        self.user_data.as_ref()
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    // -- delivery ----------------------------------------------------------

    pub fn send(&self, message: ServerMessage) -> SendOutcome {
        self.send_shared(Arc::new(message))
    }

    /// Deliver a message, queueing it while the session is detached. Fan-out
    /// callers share one `Arc` across all recipients.
    pub fn send_shared(&self, message: Arc<ServerMessage>) -> SendOutcome {
        let inner = &mut *self.inner.lock();
        if inner.closed {
            return SendOutcome::Closed;
        }
        match inner.client.clone() {
            Some(client) => match client.try_send(message.clone()) {
                Ok(()) => SendOutcome::Delivered,
                Err(SendError::Full) => SendOutcome::Overflow,
                Err(SendError::Closed) => {
                    // The write pump is gone but detach has not run yet;
                    // treat like a detached session.
                    inner.client = None;
                    inner.detached_since = Some(Instant::now());
                    inner.pending.push_back(message);
                    SendOutcome::Delivered
                }
            },
            None => {
                if inner.pending.len() >= MAX_PENDING_MESSAGES {
                    return SendOutcome::Overflow;
                }
                inner.pending.push_back(message);
                SendOutcome::Delivered
            }
        }
    }

    // -- attach / detach ---------------------------------------------------

    /// Bind a new client, flushing messages queued while detached.
    /// Returns `false` when the flush overflows the new client's queue.
    pub fn attach(&self, client: Arc<ClientHandle>) -> bool {
        let mut inner = self.inner.lock();
        inner.detached_since = None;
        inner.last_activity = Instant::now();
        while let Some(message) = inner.pending.pop_front() {
            if client.try_send(message).is_err() {
                return false;
            }
        }
        inner.client = Some(client);
        true
    }

    /// Drop the client reference; the session stays resumable.
    /// Returns the detached client, if one was attached.
    pub fn detach(&self, client: &ClientHandle) -> Option<Arc<ClientHandle>> {
        let inner = &mut *self.inner.lock();
        let is_current = inner
            .client
            .as_ref()
            .is_some_and(|current| current.id() == client.id());
        if !is_current {
            // A different client already took over (resume); nothing to do.
            return None;
        }
        inner.detached_since = Some(Instant::now());
        inner.client.take()
    }

    pub fn client(&self) -> Option<Arc<ClientHandle>> {
        self.inner.lock().client.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().client.is_some()
    }

    /// How long the session has been without a client, if detached.
    pub fn detached_since(&self) -> Option<Instant> {
        self.inner.lock().detached_since
    }

    /// Record client activity for the heartbeat check.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Mark the session closed. Returns `true` on the first call only, so
    /// teardown runs once.
    pub fn mark_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.closed = true;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    // -- room membership ---------------------------------------------------

    /// Record the room this session belongs to. The hub's room table is the
    /// authority; this is the back-reference.
    pub fn set_room(&self, room_id: Option<String>, room_session_id: Option<String>) {
        let mut inner = self.inner.lock();
        inner.room_id = room_id;
        inner.room_session_id = room_session_id;
        // Call state does not survive a room switch.
        inner.in_call = FLAG_DISCONNECTED;
    }

    pub fn room_id(&self) -> Option<String> {
        self.inner.lock().room_id.clone()
    }

    pub fn room_session_id(&self) -> Option<String> {
        self.inner.lock().room_session_id.clone()
    }

    // -- permissions and call state ----------------------------------------

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.inner.lock().permissions.has(permission)
    }

    pub fn set_permissions(&self, permissions: Vec<Permission>) {
        self.inner.lock().permissions.assign(permissions);
    }

    pub fn in_call(&self) -> u32 {
        self.inner.lock().in_call
    }

    /// Update the in-call flags. Returns `true` when the value changed.
    pub fn set_in_call(&self, in_call: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_call == in_call {
            return false;
        }
        inner.in_call = in_call;
        true
    }

    // -- wire helpers ------------------------------------------------------

    /// The sender block stamped onto forwarded `message`/`control` frames.
    pub fn sender_block(&self) -> MessageServerMessageSender {
        MessageServerMessageSender {
            sender_type: "session".to_string(),
            sessionid: self.public_id.clone(),
            userid: self.user_id.clone().unwrap_or_default(),
        }
    }

    /// The entry describing this session in room join events.
    pub fn room_event_entry(&self) -> EventServerMessageSessionEntry {
        EventServerMessageSessionEntry {
            sessionid: self.public_id.clone(),
            userid: self.user_id.clone().unwrap_or_default(),
            user: self.user_data.clone(),
            roomsessionid: self.room_session_id(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("public_id", &self.public_id)
            .field("client_type", &self.client_type)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
