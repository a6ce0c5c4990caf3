//! A named group of sessions and the fan-out of its events.
//!
//! Rooms hold session ids, not session references; the hub's session table
//! stays the single source of truth and the room resolves ids on demand.
//! All fan-out for one room runs under the room's lock, which serialises
//! concurrent joins, leaves, and updates per room. Delivery itself never
//! blocks: a member whose queue is full is reported back to the caller to be
//! closed as overloaded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::messages::{
    EventServerMessage, RoomDisinviteEventServerMessage, RoomEventServerMessage,
    RoomFlagsServerMessage, ServerMessage, TransientDataServerMessage,
};
use crate::session::{Session, SessionId, FLAG_IN_CALL};
use crate::transient::TransientData;

/// The hub's session table, shared with every room.
pub type SessionTable = Arc<DashMap<SessionId, Arc<Session>>>;

struct RoomInner {
    /// Member session ids in join order.
    members: Vec<SessionId>,
    properties: Option<Value>,
    transient: TransientData,
}

pub struct Room {
    room_id: String,
    backend_url: String,
    sessions: SessionTable,
    inner: Mutex<RoomInner>,
}

/// Sessions whose outbound queue overflowed during a fan-out. The hub closes
/// them after the room lock is released.
pub type Overloaded = Vec<Arc<Session>>;

impl Room {
    pub fn new(
        room_id: String,
        backend_url: String,
        sessions: SessionTable,
        properties: Option<Value>,
    ) -> Self {
        Self {
            room_id,
            backend_url,
            sessions,
            inner: Mutex::new(RoomInner {
                members: Vec::new(),
                properties,
                transient: TransientData::new(),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    pub fn properties(&self) -> Option<Value> {
        self.inner.lock().properties.clone()
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().members.is_empty()
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.inner.lock().members.contains(&session_id)
    }

    /// Resolve the current member sessions through the hub table.
    pub fn member_sessions(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        resolve(&self.sessions, &inner.members)
    }

    // -- membership --------------------------------------------------------

    /// Add a session and fan out the `join` event: existing members get the
    /// newcomer's entry, the newcomer gets every member including itself (in
    /// join order), followed by the transient-data snapshot.
    pub fn join(&self, session: &Arc<Session>) -> Overloaded {
        let mut inner = self.inner.lock();
        if inner.members.contains(&session.id()) {
            return Vec::new();
        }
        inner.members.push(session.id());

        let members = resolve(&self.sessions, &inner.members);
        let event = Arc::new(ServerMessage::event(EventServerMessage::room_join(vec![
            session.room_event_entry(),
        ])));

        let mut overloaded = Vec::new();
        for member in &members {
            if member.id() == session.id() {
                continue;
            }
            deliver(member, event.clone(), &mut overloaded);
        }

        let all_entries = members.iter().map(|m| m.room_event_entry()).collect();
        let newcomer_event =
            ServerMessage::event(EventServerMessage::room_join(all_entries));
        deliver(session, Arc::new(newcomer_event), &mut overloaded);

        // The newcomer always receives the current snapshot, even when empty,
        // so stale state from an earlier visit cannot linger client-side.
        let snapshot = ServerMessage::transient(TransientDataServerMessage::initial(
            inner.transient.snapshot(),
        ));
        deliver(session, Arc::new(snapshot), &mut overloaded);
        overloaded
    }

    /// Remove a session and fan out the `leave` event to the remaining
    /// members. Returns whether the session was a member plus any overloaded
    /// members.
    pub fn leave(&self, session: &Session) -> (bool, Overloaded) {
        let mut inner = self.inner.lock();
        let Some(position) = inner.members.iter().position(|id| *id == session.id()) else {
            return (false, Vec::new());
        };
        inner.members.remove(position);

        let event = Arc::new(ServerMessage::event(EventServerMessage::room_leave(vec![
            session.public_id().to_string(),
        ])));

        let mut overloaded = Vec::new();
        for member in resolve(&self.sessions, &inner.members) {
            deliver(&member, event.clone(), &mut overloaded);
        }
        (true, overloaded)
    }

    // -- messages ----------------------------------------------------------

    /// Deliver a stamped `message`/`control` frame to every member. With
    /// `call_only`, members outside the call are skipped.
    pub fn publish_session_message(
        &self,
        message: ServerMessage,
        call_only: bool,
    ) -> Overloaded {
        let inner = self.inner.lock();
        let shared = Arc::new(message);
        let mut overloaded = Vec::new();
        for member in resolve(&self.sessions, &inner.members) {
            if call_only && member.in_call() & FLAG_IN_CALL == 0 {
                continue;
            }
            deliver(&member, shared.clone(), &mut overloaded);
        }
        overloaded
    }

    /// Fan out a backend-originated room message as `event room message`.
    pub fn publish_room_message(&self, data: Value) -> Overloaded {
        let event = ServerMessage::event(EventServerMessage::room_message(
            self.room_id.clone(),
            data,
        ));
        self.broadcast(event)
    }

    // -- participant updates -----------------------------------------------

    /// Fan out in-call changes that were already applied to the sessions.
    ///
    /// When every member ends up with the same in-call value, a single
    /// `all: true` update is sent; otherwise a per-session delta list.
    pub fn publish_incall_changes(&self, changed: &[Arc<Session>]) -> Overloaded {
        if changed.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.lock();
        let members = resolve(&self.sessions, &inner.members);

        let first = changed[0].in_call();
        let uniform = members.iter().all(|member| member.in_call() == first);

        let update = if uniform {
            RoomEventServerMessage {
                roomid: self.room_id.clone(),
                incall: Some(first),
                all: Some(true),
                ..Default::default()
            }
        } else {
            let users = changed
                .iter()
                .map(|session| {
                    json!({
                        "sessionId": session.public_id(),
                        "inCall": session.in_call(),
                    })
                })
                .collect();
            RoomEventServerMessage {
                roomid: self.room_id.clone(),
                users: Some(users),
                ..Default::default()
            }
        };

        let event = Arc::new(ServerMessage::event(EventServerMessage::participants_update(
            update,
        )));
        let mut overloaded = Vec::new();
        for member in members {
            deliver(&member, event.clone(), &mut overloaded);
        }
        overloaded
    }

    /// Fan out a permissions change for one session.
    pub fn publish_permissions_update(&self, session: &Session) -> Overloaded {
        let users = vec![json!({
            "sessionId": session.public_id(),
            "permissions": session_permissions(session),
        })];
        let event = ServerMessage::event(EventServerMessage::participants_update(
            RoomEventServerMessage {
                roomid: self.room_id.clone(),
                users: Some(users),
                ..Default::default()
            },
        ));
        self.broadcast(event)
    }

    /// Fan out the in-call flags of a single session as `participants flags`.
    pub fn publish_session_flags(&self, session: &Session) -> Overloaded {
        let event = ServerMessage::event(EventServerMessage::participants_flags(
            RoomFlagsServerMessage {
                roomid: self.room_id.clone(),
                sessionid: session.public_id().to_string(),
                incall: session.in_call(),
            },
        ));
        self.broadcast(event)
    }

    // -- room properties ---------------------------------------------------

    /// Install new backend properties; fans out a `roomlist update` when they
    /// actually changed.
    pub fn update_properties(&self, properties: Option<Value>) -> Overloaded {
        let mut inner = self.inner.lock();
        if inner.properties == properties {
            return Vec::new();
        }
        inner.properties = properties.clone();

        let event = Arc::new(ServerMessage::event(EventServerMessage::roomlist_update(
            RoomEventServerMessage {
                roomid: self.room_id.clone(),
                properties,
                ..Default::default()
            },
        )));
        let mut overloaded = Vec::new();
        for member in resolve(&self.sessions, &inner.members) {
            deliver(&member, event.clone(), &mut overloaded);
        }
        overloaded
    }

    /// Notify the sessions of `user_ids` that they lost access. Returns the
    /// affected member sessions (for the hub to remove) and any overloaded
    /// members.
    pub fn disinvite(&self, user_ids: &[String]) -> (Vec<Arc<Session>>, Overloaded) {
        let inner = self.inner.lock();
        let affected: Vec<Arc<Session>> = resolve(&self.sessions, &inner.members)
            .into_iter()
            .filter(|member| {
                member
                    .user_id()
                    .is_some_and(|user| user_ids.iter().any(|id| id == user))
            })
            .collect();

        let event = Arc::new(ServerMessage::event(EventServerMessage::roomlist_disinvite(
            RoomDisinviteEventServerMessage {
                roomid: self.room_id.clone(),
                reason: Some("disinvited".to_string()),
            },
        )));
        let mut overloaded = Vec::new();
        for member in &affected {
            deliver(member, event.clone(), &mut overloaded);
        }
        (affected, overloaded)
    }

    // -- transient data ----------------------------------------------------

    /// Store a transient value and fan out the change. No event is sent when
    /// the value did not change.
    pub fn set_transient(&self, key: &str, value: Value, ttl: Option<Duration>) -> Overloaded {
        let mut inner = self.inner.lock();
        let Some(old_value) = inner.transient.set(key, value.clone(), ttl) else {
            return Vec::new();
        };
        let message = ServerMessage::transient(TransientDataServerMessage::set(
            key.to_string(),
            value,
            old_value,
        ));
        broadcast_locked(&self.sessions, &inner.members, message)
    }

    /// Remove a transient value and fan out the removal.
    pub fn remove_transient(&self, key: &str) -> Overloaded {
        let mut inner = self.inner.lock();
        let Some(old_value) = inner.transient.remove(key) else {
            return Vec::new();
        };
        let message = ServerMessage::transient(TransientDataServerMessage::remove(
            key.to_string(),
            Some(old_value),
        ));
        broadcast_locked(&self.sessions, &inner.members, message)
    }

    /// Expire transient entries; each expiry fans out like a remove.
    pub fn expire_transient(&self, now: Instant) -> Overloaded {
        let mut inner = self.inner.lock();
        let expired = inner.transient.expire(now);
        let mut overloaded = Vec::new();
        for (key, old_value) in expired {
            let message =
                ServerMessage::transient(TransientDataServerMessage::remove(key, Some(old_value)));
            overloaded.extend(broadcast_locked(&self.sessions, &inner.members, message));
        }
        overloaded
    }

    fn broadcast(&self, message: ServerMessage) -> Overloaded {
        let inner = self.inner.lock();
        broadcast_locked(&self.sessions, &inner.members, message)
    }
}

fn resolve(sessions: &SessionTable, members: &[SessionId]) -> Vec<Arc<Session>> {
    members
        .iter()
        .filter_map(|id| sessions.get(id).map(|entry| entry.value().clone()))
        .collect()
}

fn broadcast_locked(
    sessions: &SessionTable,
    members: &[SessionId],
    message: ServerMessage,
) -> Overloaded {
    let shared = Arc::new(message);
    let mut overloaded = Vec::new();
    for member in resolve(sessions, members) {
        deliver(&member, shared.clone(), &mut overloaded);
    }
    overloaded
}

fn deliver(session: &Arc<Session>, message: Arc<ServerMessage>, overloaded: &mut Overloaded) {
    if session.send_shared(message) == crate::session::SendOutcome::Overflow {
        overloaded.push(session.clone());
    }
}

fn session_permissions(session: &Session) -> Vec<crate::permissions::Permission> {
    use crate::permissions::Permission;
    [
        Permission::PublishMedia,
        Permission::PublishScreen,
        Permission::TransientData,
        Permission::SendControl,
        Permission::HideDisplayNames,
    ]
    .into_iter()
    .filter(|p| session.has_permission(*p))
    .collect()
}
