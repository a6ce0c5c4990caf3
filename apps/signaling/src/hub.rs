//! Process-wide registry and router: owns the session, resume, and room
//! tables, runs the hello/resume flows, routes client-to-client messages,
//! dispatches federation envelopes, and drives the heartbeat and expiry
//! timers.
//!
//! Locking: the tables are sharded maps; every lookup clones the `Arc` out
//! before touching a room or session lock, and no backend call or federation
//! publish happens while any table reference or lock is held. Lock order is
//! hub table, then room, then session, then client queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use chorus_common::id::random_token;
use chorus_common::LruCache;

use crate::async_message::{AsyncMessage, BackendRoomRequest, SendOfferMessage};
use crate::auth::{validate_internal_auth, TokenKeyStore};
use crate::backend::{BackendClient, BackendError};
use crate::client::ClientHandle;
use crate::config::Config;
use crate::error::Error;
use crate::federation::{AsyncEvents, AsyncTarget};
use crate::ids::{PublicIdCodec, SessionIdData};
use crate::messages::{
    ClientMessage, EventServerMessage, HelloClientMessage, HelloServerMessage,
    InternalClientMessage, MessageClientMessage, RoomClientMessage, ServerMessage,
    TransientDataClientMessage, WelcomeServerMessage, HELLO_VERSION_V2,
};
use crate::permissions::Permission;
use crate::room::{Overloaded, Room, SessionTable};
use crate::session::{ClientType, SendOutcome, Session, SessionId};

/// Bound of the public-id decode cache.
const DECODE_CACHE_SIZE: usize = 1024;

/// Length in bytes of the resume secret.
const RESUME_ID_BYTES: usize = 32;

/// Interval of the detached-session and transient-TTL sweep.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Interval of the backend room keep-alive ping.
const ROOM_PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct HelloV2Params {
    token: String,
}

#[derive(Debug, Deserialize)]
struct InternalAuthParams {
    random: String,
    token: String,
    backend: String,
}

pub struct Hub {
    config: Arc<Config>,
    codec: PublicIdCodec,
    sessions: SessionTable,
    resume: DashMap<String, SessionId>,
    rooms: DashMap<String, Arc<Room>>,
    decode_cache: Mutex<LruCache<String, SessionIdData>>,
    backend_sessions: DashMap<String, usize>,
    next_session_id: AtomicU64,
    backend: Arc<dyn BackendClient>,
    events: Arc<dyn AsyncEvents>,
    token_keys: Arc<TokenKeyStore>,
    shutdown: watch::Sender<bool>,
}

fn room_key(backend_url: &str, room_id: &str) -> String {
    format!("{backend_url}|{room_id}")
}

impl Hub {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn BackendClient>,
        events: Arc<dyn AsyncEvents>,
        token_keys: Arc<TokenKeyStore>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            codec: PublicIdCodec::new(config.session_secret.as_bytes()),
            config,
            sessions: Arc::new(DashMap::new()),
            resume: DashMap::new(),
            rooms: DashMap::new(),
            decode_cache: Mutex::new(LruCache::new(DECODE_CACHE_SIZE)),
            backend_sessions: DashMap::new(),
            next_session_id: AtomicU64::new(0),
            backend,
            events,
            token_keys,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    // -- hello / resume ----------------------------------------------------

    /// Handle a `hello` from a connection without a session yet. Replies on
    /// success and failure; returns the new session on success.
    pub async fn process_hello(
        &self,
        client: &Arc<ClientHandle>,
        message: &ClientMessage,
    ) -> Option<Arc<Session>> {
        let id = message.id.clone();
        let hello = match &message.hello {
            Some(hello) => hello,
            None => {
                send_to_client(client, ServerMessage::error(id, Error::hello_expected()));
                return None;
            }
        };

        if let Some(resume_id) = &hello.resumeid {
            return self.process_resume(client, id, hello, resume_id);
        }

        match self.process_hello_auth(client, hello).await {
            Ok(session) => {
                let reply = ServerMessage::hello(
                    id,
                    HelloServerMessage {
                        version: hello.version.clone(),
                        sessionid: session.public_id().to_string(),
                        resumeid: session.resume_id().to_string(),
                        userid: session.user_id().unwrap_or_default().to_string(),
                        server: Some(WelcomeServerMessage::default()),
                    },
                );
                session.send(reply);
                tracing::info!(
                    session_id = session.id(),
                    public_id = session.public_id(),
                    user_id = session.user_id().unwrap_or_default(),
                    client_type = session.client_type().as_str(),
                    "session established"
                );
                Some(session)
            }
            Err(error) => {
                send_to_client(client, ServerMessage::error(id, error));
                None
            }
        }
    }

    fn process_resume(
        &self,
        client: &Arc<ClientHandle>,
        id: Option<String>,
        hello: &HelloClientMessage,
        resume_id: &str,
    ) -> Option<Arc<Session>> {
        let session = self
            .resume
            .get(resume_id)
            .map(|entry| *entry.value())
            .and_then(|session_id| {
                self.sessions
                    .get(&session_id)
                    .map(|entry| entry.value().clone())
            });

        let Some(session) = session else {
            send_to_client(client, ServerMessage::error(id, Error::no_such_session()));
            return None;
        };
        if session.is_closed() {
            send_to_client(client, ServerMessage::error(id, Error::no_such_session()));
            return None;
        }

        // A lingering previous socket loses the session to the new one.
        if let Some(old) = session.client() {
            old.request_close();
        }
        if !session.attach(client.clone()) {
            // Flushing the backlog overflowed the fresh queue.
            self.close_session(&session);
            send_to_client(client, ServerMessage::error(id, Error::server_error()));
            return None;
        }
        session.touch();

        let reply = ServerMessage::hello(
            id,
            HelloServerMessage {
                version: hello.version.clone(),
                sessionid: session.public_id().to_string(),
                resumeid: session.resume_id().to_string(),
                userid: session.user_id().unwrap_or_default().to_string(),
                server: Some(WelcomeServerMessage::default()),
            },
        );
        session.send(reply);
        tracing::info!(
            session_id = session.id(),
            public_id = session.public_id(),
            "session resumed"
        );
        Some(session)
    }

    async fn process_hello_auth(
        &self,
        client: &Arc<ClientHandle>,
        hello: &HelloClientMessage,
    ) -> Result<Arc<Session>, Error> {
        let auth = hello
            .auth
            .as_ref()
            .ok_or_else(|| Error::invalid_message("hello auth missing"))?;
        let features = hello.features.clone().unwrap_or_default();

        match auth.client_type.as_str() {
            "" | "client" => {
                let backend_url = auth.url.clone();
                let (user_id, user_data) = if hello.version == HELLO_VERSION_V2 {
                    let params: HelloV2Params = serde_json::from_value(auth.params.clone())
                        .map_err(|_| Error::invalid_message("hello v2 token missing"))?;
                    let claims = self.token_keys.verify_hello_v2(&params.token, &backend_url)?;
                    (Some(claims.sub), claims.userdata)
                } else {
                    let response = self
                        .backend
                        .validate_auth(&backend_url, &auth.params)
                        .await
                        .map_err(map_auth_error)?;
                    (response.user_id, response.user)
                };
                self.create_session(
                    client,
                    ClientType::Client,
                    backend_url,
                    user_id,
                    user_data,
                    features,
                )
            }
            "internal" => {
                let params: InternalAuthParams = serde_json::from_value(auth.params.clone())
                    .map_err(|_| Error::invalid_message("internal auth params missing"))?;
                if !validate_internal_auth(
                    &params.random,
                    &params.token,
                    self.config.internal_secret.as_bytes(),
                ) {
                    return Err(Error::auth_failed("invalid internal token"));
                }
                self.create_session(
                    client,
                    ClientType::Internal,
                    params.backend,
                    None,
                    None,
                    features,
                )
            }
            other => Err(Error::invalid_message(format!(
                "unsupported client type {other}"
            ))),
        }
    }

    fn create_session(
        &self,
        client: &Arc<ClientHandle>,
        client_type: ClientType,
        backend_url: String,
        user_id: Option<String>,
        user_data: Option<Value>,
        features: Vec<String>,
    ) -> Result<Arc<Session>, Error> {
        let limit = self.config.session_limit;
        {
            let mut count = self
                .backend_sessions
                .entry(backend_url.clone())
                .or_insert(0);
            if limit > 0 && *count >= limit {
                return Err(Error::session_limit_exceeded());
            }
            *count += 1;
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let public_id = self.codec.encode(&SessionIdData {
            backend_url: backend_url.clone(),
            session_id,
        });
        let resume_id = random_token(RESUME_ID_BYTES);

        let session = Arc::new(Session::new(
            session_id,
            public_id,
            resume_id.clone(),
            client_type,
            backend_url,
            user_id,
            user_data,
            features,
            client.clone(),
        ));
        self.sessions.insert(session_id, session.clone());
        self.resume.insert(resume_id, session_id);
        Ok(session)
    }

    // -- lookup ------------------------------------------------------------

    /// Decode a public session id, memoised through the LRU cache.
    pub fn decode_public_id(&self, public_id: &str) -> Option<SessionIdData> {
        {
            let mut cache = self.decode_cache.lock();
            if let Some(data) = cache.get(&public_id.to_string()) {
                return Some(data.clone());
            }
        }
        let decoded = self.codec.decode(public_id)?;
        self.decode_cache
            .lock()
            .set(public_id.to_string(), decoded.clone());
        Some(decoded)
    }

    /// Find the local session behind a public id.
    pub fn lookup_public_id(&self, public_id: &str) -> Option<Arc<Session>> {
        let data = self.decode_public_id(public_id)?;
        self.sessions
            .get(&data.session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn get_room(&self, backend_url: &str, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .get(&room_key(backend_url, room_id))
            .map(|entry| entry.value().clone())
    }

    // -- room join / leave -------------------------------------------------

    /// Handle a `room` request. An empty room id leaves the current room
    /// without joining another.
    pub async fn process_room(
        &self,
        session: &Arc<Session>,
        id: Option<String>,
        request: &RoomClientMessage,
    ) {
        let target = request.roomid.clone();

        if !target.is_empty() && session.room_id().as_deref() == Some(target.as_str()) {
            session.send(ServerMessage::error(id, Error::already_joined()));
            return;
        }

        if target.is_empty() {
            self.leave_current_room(session);
            session.send(ServerMessage::room(id, String::new(), None));
            return;
        }

        let response = match self
            .backend
            .join_room(
                session.backend_url(),
                &target,
                session.user_id(),
                request.sessionid.as_deref(),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(room_id = %target, %err, "room join rejected");
                session.send(ServerMessage::error(id, map_join_error(err)));
                return;
            }
        };

        self.leave_current_room(session);

        let key = room_key(session.backend_url(), &target);
        let room = self
            .rooms
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Room::new(
                    target.clone(),
                    session.backend_url().to_string(),
                    self.sessions.clone(),
                    response.properties.clone(),
                ))
            })
            .clone();

        // The join response carries the freshest properties; members of an
        // existing room learn about changes through the roomlist update.
        let overloaded = room.update_properties(response.properties.clone());
        self.close_overloaded(overloaded);

        if let Some(permissions) = response.permissions {
            session.set_permissions(permissions);
        }
        session.set_room(Some(target.clone()), request.sessionid.clone());

        // Ack first, then the join fan-out (which includes the joiner).
        session.send(ServerMessage::room(id, target, room.properties()));
        let overloaded = room.join(session);
        self.close_overloaded(overloaded);
    }

    /// Remove the session from its current room, if any, with leave fan-out
    /// and backend notification.
    fn leave_current_room(&self, session: &Arc<Session>) {
        let Some(room_id) = session.room_id() else {
            return;
        };
        let room_session_id = session.room_session_id();
        session.set_room(None, None);

        let key = room_key(session.backend_url(), &room_id);
        let Some(room) = self.rooms.get(&key).map(|entry| entry.value().clone()) else {
            return;
        };
        let (removed, overloaded) = room.leave(session);
        self.rooms.remove_if(&key, |_, room| room.is_empty());
        self.close_overloaded(overloaded);

        if removed {
            if let Some(room_session_id) = room_session_id {
                self.notify_backend_leave(session.backend_url(), &room_id, room_session_id);
            }
        }
    }

    /// Tell the backend that a room session went away, off the caller's path.
    fn notify_backend_leave(&self, backend_url: &str, room_id: &str, room_session_id: String) {
        let backend = self.backend.clone();
        let backend_url = backend_url.to_string();
        let room_id = room_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = backend
                .leave_room(&backend_url, &room_id, &[room_session_id])
                .await
            {
                tracing::warn!(%room_id, %err, "backend leave notification failed");
            }
        });
    }

    // -- message routing ---------------------------------------------------

    /// Route a `message` or `control` frame by its recipient.
    pub async fn process_message(
        &self,
        session: &Arc<Session>,
        id: Option<String>,
        message: &MessageClientMessage,
        control: bool,
    ) {
        if control && !session.has_permission(Permission::SendControl) {
            session.send(ServerMessage::error(id, Error::permission_denied()));
            return;
        }
        if !control
            && message.data.get("type").and_then(Value::as_str) == Some("offer")
            && !session.has_permission(Permission::PublishMedia)
        {
            session.send(ServerMessage::error(id, Error::permission_denied()));
            return;
        }

        let sender = session.sender_block();
        let outgoing = if control {
            ServerMessage::control(sender, message.data.clone())
        } else {
            ServerMessage::message(sender, message.data.clone())
        };

        match message.recipient.recipient_type.as_str() {
            "session" => {
                let target_id = message.recipient.sessionid.as_deref().unwrap_or_default();
                let Some(decoded) = self.decode_public_id(target_id) else {
                    session.send(ServerMessage::error(id, Error::client_not_found()));
                    return;
                };
                match self.sessions.get(&decoded.session_id).map(|e| e.value().clone()) {
                    Some(target) => {
                        if target.send(outgoing) == SendOutcome::Overflow {
                            self.close_overloaded(vec![target]);
                        }
                    }
                    None => {
                        // Hosted elsewhere: hand the stamped message to the
                        // federation transport.
                        let mut forwarded = outgoing;
                        if let Some(inner) = forwarded.message.as_mut() {
                            inner.recipient = Some(message.recipient.clone());
                        }
                        if let Some(inner) = forwarded.control.as_mut() {
                            inner.recipient = Some(message.recipient.clone());
                        }
                        let envelope = AsyncMessage::message(forwarded);
                        if let Err(err) = self
                            .events
                            .publish(AsyncTarget::Session(target_id.to_string()), envelope)
                            .await
                        {
                            tracing::warn!(target = %target_id, %err, "federation forward failed");
                        }
                    }
                }
            }
            "user" => {
                let user_id = message.recipient.userid.as_deref().unwrap_or_default();
                let targets: Vec<Arc<Session>> = self
                    .sessions
                    .iter()
                    .map(|entry| entry.value().clone())
                    .filter(|candidate| {
                        candidate.backend_url() == session.backend_url()
                            && candidate.user_id() == Some(user_id)
                    })
                    .collect();
                if targets.is_empty() {
                    let envelope = AsyncMessage::message(outgoing);
                    let target = AsyncTarget::User {
                        backend_url: session.backend_url().to_string(),
                        user_id: user_id.to_string(),
                    };
                    if let Err(err) = self.events.publish(target, envelope).await {
                        tracing::warn!(user = %user_id, %err, "federation forward failed");
                    }
                    return;
                }
                let shared = Arc::new(outgoing);
                let mut overloaded = Vec::new();
                for target in targets {
                    if target.send_shared(shared.clone()) == SendOutcome::Overflow {
                        overloaded.push(target);
                    }
                }
                self.close_overloaded(overloaded);
            }
            "room" | "call" => {
                let Some(room_id) = session.room_id() else {
                    tracing::debug!(
                        session_id = session.id(),
                        "dropping room message from session without a room"
                    );
                    return;
                };
                let Some(room) = self.get_room(session.backend_url(), &room_id) else {
                    return;
                };
                let call_only = message.recipient.recipient_type == "call";
                let overloaded = room.publish_session_message(outgoing, call_only);
                self.close_overloaded(overloaded);
            }
            _ => {
                session.send(ServerMessage::error(
                    id,
                    Error::invalid_message("unsupported recipient type"),
                ));
            }
        }
    }

    // -- transient data ----------------------------------------------------

    pub fn process_transient(
        &self,
        session: &Arc<Session>,
        id: Option<String>,
        request: &TransientDataClientMessage,
    ) {
        let Some(room_id) = session.room_id() else {
            tracing::debug!(
                session_id = session.id(),
                "dropping transient request from session without a room"
            );
            return;
        };
        if !session.has_permission(Permission::TransientData) {
            session.send(ServerMessage::error(id, Error::permission_denied()));
            return;
        }
        let Some(room) = self.get_room(session.backend_url(), &room_id) else {
            return;
        };
        let key = request.key.as_deref().unwrap_or_default();

        let overloaded = match request.kind.as_str() {
            "set" => {
                let ttl = request
                    .ttl
                    .filter(|ttl| *ttl > 0)
                    .map(std::time::Duration::from_nanos);
                let value = request.value.clone().unwrap_or(Value::Null);
                room.set_transient(key, value, ttl)
            }
            "remove" => room.remove_transient(key),
            _ => Vec::new(),
        };
        self.close_overloaded(overloaded);
    }

    // -- internal clients --------------------------------------------------

    pub fn process_internal(
        &self,
        session: &Arc<Session>,
        id: Option<String>,
        request: &InternalClientMessage,
    ) {
        if session.client_type() != ClientType::Internal {
            session.send(ServerMessage::error(id, Error::permission_denied()));
            return;
        }
        match request.kind.as_str() {
            "incall" => {
                let Some(incall) = &request.incall else {
                    session.send(ServerMessage::error(
                        id,
                        Error::invalid_message("incall payload missing"),
                    ));
                    return;
                };
                if !session.set_in_call(incall.incall) {
                    return;
                }
                if let Some(room_id) = session.room_id() {
                    if let Some(room) = self.get_room(session.backend_url(), &room_id) {
                        let overloaded = room.publish_session_flags(session);
                        self.close_overloaded(overloaded);
                    }
                }
            }
            other => {
                session.send(ServerMessage::error(
                    id,
                    Error::invalid_message(format!("unsupported internal type {other}")),
                ));
            }
        }
    }

    // -- bye / teardown ----------------------------------------------------

    pub fn process_bye(&self, session: &Arc<Session>, id: Option<String>) {
        session.send(ServerMessage::bye(id, None));
        self.close_session(session);
    }

    /// The socket of `client` is gone. The session stays resumable until the
    /// resume window lapses; only then is it destroyed.
    pub fn client_gone(&self, session: &Arc<Session>, client: &ClientHandle) {
        if session.detach(client).is_some() {
            tracing::debug!(
                session_id = session.id(),
                "client disconnected, session detached"
            );
        }
    }

    /// Destroy a session: drop it from the tables, leave its room with a
    /// `leave` fan-out, and close its client.
    pub fn close_session(&self, session: &Arc<Session>) {
        let overloaded = self.destroy_session_inner(session);
        self.close_overloaded(overloaded);
    }

    fn destroy_session_inner(&self, session: &Arc<Session>) -> Overloaded {
        if !session.mark_closed() {
            return Vec::new();
        }

        self.sessions.remove(&session.id());
        self.resume.remove(session.resume_id());
        if let Some(mut count) = self.backend_sessions.get_mut(session.backend_url()) {
            *count = count.saturating_sub(1);
        }

        let mut overloaded = Vec::new();
        if let Some(room_id) = session.room_id() {
            let room_session_id = session.room_session_id();
            let key = room_key(session.backend_url(), &room_id);
            if let Some(room) = self.rooms.get(&key).map(|entry| entry.value().clone()) {
                let (removed, more) = room.leave(session);
                overloaded = more;
                self.rooms.remove_if(&key, |_, room| room.is_empty());
                if removed {
                    if let Some(room_session_id) = room_session_id {
                        self.notify_backend_leave(session.backend_url(), &room_id, room_session_id);
                    }
                }
            }
        }

        if let Some(client) = session.client() {
            client.request_close();
        }
        tracing::info!(
            session_id = session.id(),
            public_id = session.public_id(),
            "session destroyed"
        );
        overloaded
    }

    /// Close sessions whose outbound queue overflowed. Tearing one down can
    /// overflow further queues, so this drains a worklist.
    fn close_overloaded(&self, mut overloaded: Overloaded) {
        while let Some(session) = overloaded.pop() {
            tracing::warn!(
                session_id = session.id(),
                public_id = session.public_id(),
                "session queue overflowed, closing"
            );
            overloaded.extend(self.destroy_session_inner(&session));
        }
    }

    // -- federation --------------------------------------------------------

    /// Dispatch an envelope from the federation feed to the matching local
    /// session or room.
    pub fn deliver_async(&self, target: AsyncTarget, message: AsyncMessage) {
        match message.kind.as_str() {
            "message" => self.deliver_async_server_message(target, message),
            "permissions" => {
                let Some(permissions) = message.permissions else {
                    return;
                };
                let Some(session) = self.lookup_public_id(&permissions.sessionid) else {
                    tracing::debug!(target = %permissions.sessionid, "permissions for unknown session, dropping");
                    return;
                };
                session.set_permissions(permissions.permissions);
                if let Some(room_id) = session.room_id() {
                    if let Some(room) = self.get_room(session.backend_url(), &room_id) {
                        let overloaded = room.publish_permissions_update(&session);
                        self.close_overloaded(overloaded);
                    }
                }
            }
            "sendoffer" => {
                let Some(offer) = message.sendoffer else {
                    return;
                };
                self.deliver_send_offer(offer);
            }
            "room" => {
                let Some(request) = message.room else {
                    return;
                };
                self.apply_room_request(request);
            }
            "asyncroom" => {
                // Membership bookkeeping for sessions hosted elsewhere; a
                // single instance has nothing to update.
                if let Some(asyncroom) = message.asyncroom {
                    tracing::debug!(
                        kind = %asyncroom.kind,
                        session = %asyncroom.sessionid,
                        "asyncroom event for remote session"
                    );
                }
            }
            other => {
                tracing::warn!(kind = %other, "unknown async message type, dropping");
            }
        }
    }

    fn deliver_async_server_message(&self, target: AsyncTarget, message: AsyncMessage) {
        let Some(server_message) = message.message else {
            return;
        };
        match target {
            AsyncTarget::Session(public_id) => {
                let Some(session) = self.lookup_public_id(&public_id) else {
                    tracing::debug!(target = %public_id, "async message for unknown session, dropping");
                    return;
                };
                if session.send(server_message) == SendOutcome::Overflow {
                    self.close_overloaded(vec![session]);
                }
            }
            AsyncTarget::User {
                backend_url,
                user_id,
            } => {
                let shared = Arc::new(server_message);
                let mut overloaded = Vec::new();
                for entry in self.sessions.iter() {
                    let candidate = entry.value();
                    if candidate.backend_url() == backend_url
                        && candidate.user_id() == Some(user_id.as_str())
                        && candidate.send_shared(shared.clone()) == SendOutcome::Overflow
                    {
                        overloaded.push(candidate.clone());
                    }
                }
                self.close_overloaded(overloaded);
            }
            AsyncTarget::Room {
                backend_url,
                room_id,
            } => {
                let Some(room) = self.get_room(&backend_url, &room_id) else {
                    return;
                };
                let overloaded = room.publish_session_message(server_message, false);
                self.close_overloaded(overloaded);
            }
        }
    }

    fn deliver_send_offer(&self, offer: SendOfferMessage) {
        let Some(session) = self.lookup_public_id(&offer.sessionid) else {
            tracing::debug!(target = %offer.sessionid, "send offer for unknown session, dropping");
            return;
        };
        let mut outgoing = ServerMessage::message(
            crate::messages::MessageServerMessageSender {
                sender_type: "session".to_string(),
                sessionid: offer.sessionid.clone(),
                userid: String::new(),
            },
            offer.data,
        );
        if !offer.messageid.is_empty() {
            outgoing.id = Some(offer.messageid);
        }
        if session.send(outgoing) == SendOutcome::Overflow {
            self.close_overloaded(vec![session]);
        }
    }

    /// Apply a backend room request: property updates, disinvites, in-call
    /// changes, room messages, and switch-to instructions.
    fn apply_room_request(&self, request: BackendRoomRequest) {
        let Some(room) = self.get_room(&request.backend_url, &request.roomid) else {
            tracing::debug!(room_id = %request.roomid, "room request for unknown room, dropping");
            return;
        };

        match request.kind.as_str() {
            "update" => {
                let overloaded = room.update_properties(request.properties);
                self.close_overloaded(overloaded);
            }
            "disinvite" => {
                let user_ids = request.userids.unwrap_or_default();
                let (affected, overloaded) = room.disinvite(&user_ids);
                self.close_overloaded(overloaded);
                for session in affected {
                    session.set_room(None, None);
                    let (_, overloaded) = room.leave(&session);
                    self.close_overloaded(overloaded);
                }
                let key = room_key(&request.backend_url, &request.roomid);
                self.rooms.remove_if(&key, |_, room| room.is_empty());
            }
            "incall" => {
                let Some(incall) = request.incall else {
                    return;
                };
                let members = room.member_sessions();
                let targets: Vec<Arc<Session>> = match &request.sessionids {
                    Some(ids) => members
                        .into_iter()
                        .filter(|member| ids.iter().any(|id| id == member.public_id()))
                        .collect(),
                    None => members,
                };
                let changed: Vec<Arc<Session>> = targets
                    .into_iter()
                    .filter(|session| session.set_in_call(incall))
                    .collect();
                let overloaded = room.publish_incall_changes(&changed);
                self.close_overloaded(overloaded);
            }
            "message" => {
                let overloaded = room.publish_room_message(request.data.unwrap_or(Value::Null));
                self.close_overloaded(overloaded);
            }
            "switchto" => {
                let details = request.data.unwrap_or(Value::Null);
                let target_room = details
                    .get("roomid")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let switch_details = details.get("details").cloned();
                for public_id in request.sessionids.unwrap_or_default() {
                    let Some(session) = self.lookup_public_id(&public_id) else {
                        continue;
                    };
                    let event = ServerMessage::event(EventServerMessage::room_switchto(
                        target_room.clone(),
                        switch_details.clone(),
                    ));
                    if session.send(event) == SendOutcome::Overflow {
                        self.close_overloaded(vec![session]);
                    }
                }
            }
            other => {
                tracing::warn!(kind = %other, "unknown room request type, dropping");
            }
        }
    }

    /// Publish a backend room request to every instance serving the room.
    /// The local instance receives it through its federation feed as well.
    pub async fn publish_room_request(&self, request: BackendRoomRequest) {
        let target = AsyncTarget::Room {
            backend_url: request.backend_url.clone(),
            room_id: request.roomid.clone(),
        };
        if let Err(err) = self.events.publish(target, AsyncMessage::room(request)).await {
            tracing::warn!(%err, "publishing room request failed");
        }
    }

    // -- background tasks --------------------------------------------------

    /// Spawn the federation-receive task, the heartbeat ticker, and the
    /// detached/TTL sweeper. All exit on shutdown.
    pub fn start(
        self: &Arc<Self>,
        mut federation_rx: mpsc::UnboundedReceiver<(AsyncTarget, AsyncMessage)>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let hub = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = federation_rx.recv() => {
                        match received {
                            Some((target, message)) => hub.deliver_async(target, message),
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));

        let hub = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(hub.config.heartbeat_interval);
            let mut room_ping = tokio::time::interval(ROOM_PING_INTERVAL);
            heartbeat.tick().await;
            room_ping.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => hub.check_attached_sessions(),
                    _ = room_ping.tick() => hub.ping_rooms(),
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));

        let hub = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            sweep.tick().await;
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        hub.expire_detached_sessions();
                        hub.expire_transient_data();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));

        handles
    }

    /// Ping attached sessions; close those silent beyond the session timeout.
    fn check_attached_sessions(&self) {
        let now = Instant::now();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            let Some(client) = session.client() else {
                continue;
            };
            if now.duration_since(session.last_activity()) > self.config.session_timeout {
                tracing::info!(
                    session_id = session.id(),
                    "session timed out, closing connection"
                );
                // Closing the socket detaches the session; it stays
                // resumable for the resume window.
                client.request_close();
            } else {
                client.try_ping();
            }
        }
    }

    /// Destroy sessions whose resume window lapsed.
    fn expire_detached_sessions(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            if let Some(since) = session.detached_since() {
                if since.elapsed() > self.config.resume_window {
                    tracing::info!(
                        session_id = session.id(),
                        "resume window expired, destroying session"
                    );
                    self.close_session(&session);
                }
            }
        }
    }

    fn expire_transient_data(&self) {
        let now = Instant::now();
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for room in rooms {
            let overloaded = room.expire_transient(now);
            self.close_overloaded(overloaded);
        }
    }

    fn ping_rooms(&self) {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for room in rooms {
            let room_session_ids: Vec<String> = room
                .member_sessions()
                .iter()
                .filter_map(|session| session.room_session_id())
                .collect();
            if room_session_ids.is_empty() {
                continue;
            }
            let backend = self.backend.clone();
            let backend_url = room.backend_url().to_string();
            let room_id = room.room_id().to_string();
            tokio::spawn(async move {
                if let Err(err) = backend
                    .ping_room(&backend_url, &room_id, &room_session_ids)
                    .await
                {
                    tracing::warn!(%room_id, %err, "backend room ping failed");
                }
            });
        }
    }

    /// Stop background tasks and close every session with a `bye`.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.send(ServerMessage::bye(None, Some("shutdown".to_string())));
            self.close_session(&session);
        }
    }
}

fn send_to_client(client: &Arc<ClientHandle>, message: ServerMessage) {
    let _ = client.try_send(Arc::new(message));
}

fn map_auth_error(err: BackendError) -> Error {
    match err {
        BackendError::Rejected { code, message } => Error::new(code, message),
        err => {
            tracing::error!(%err, "backend auth validation failed");
            Error::auth_failed("backend validation failed")
        }
    }
}

fn map_join_error(err: BackendError) -> Error {
    match err {
        BackendError::Rejected { code, message } => Error::new(code, message),
        err => {
            tracing::error!(%err, "backend room join failed");
            Error::room_join_failed("backend request failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::client::OutboundItem;
    use crate::federation::LoopbackEvents;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    const BACKEND_URL: &str = "https://backend.example/ocs";

    fn make_hub() -> (
        Arc<Hub>,
        Arc<MemoryBackend>,
        mpsc::UnboundedReceiver<(AsyncTarget, AsyncMessage)>,
    ) {
        let config = Arc::new(Config {
            session_secret: "test-session-secret".to_string(),
            internal_secret: "test-internal-secret".to_string(),
            ..Config::default()
        });
        let backend = Arc::new(MemoryBackend::new());
        let (events, federation_rx) = LoopbackEvents::new();
        let hub = Hub::new(
            config,
            backend.clone(),
            events,
            Arc::new(TokenKeyStore::empty()),
        );
        (hub, backend, federation_rx)
    }

    fn hello_message(user_id: &str) -> ClientMessage {
        ClientMessage {
            id: Some("1234".to_string()),
            kind: "hello".to_string(),
            hello: Some(HelloClientMessage {
                version: "1.0".to_string(),
                auth: Some(crate::messages::HelloClientMessageAuth {
                    client_type: String::new(),
                    url: BACKEND_URL.to_string(),
                    params: json!({"userid": user_id}),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn connect(hub: &Hub, user_id: &str) -> (Arc<Session>, Receiver<OutboundItem>) {
        let (client, mut rx) = ClientHandle::for_tests(64);
        let session = hub
            .process_hello(&client, &hello_message(user_id))
            .await
            .expect("hello succeeds");
        // Drain the hello reply.
        let hello = recv_message(&mut rx);
        assert_eq!(hello.kind, "hello");
        (session, rx)
    }

    fn recv_message(rx: &mut Receiver<OutboundItem>) -> ServerMessage {
        loop {
            match rx.try_recv().expect("expected a message") {
                OutboundItem::Message(msg) => return msg.as_ref().clone(),
                OutboundItem::Ping => continue,
            }
        }
    }

    fn drain(rx: &mut Receiver<OutboundItem>) {
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn hello_v1_creates_session() {
        let (hub, _, _rx) = make_hub();
        let (client, mut rx) = ClientHandle::for_tests(64);

        let session = hub
            .process_hello(&client, &hello_message("alice"))
            .await
            .unwrap();
        assert_eq!(session.user_id(), Some("alice"));
        assert_eq!(hub.session_count(), 1);

        let reply = recv_message(&mut rx);
        assert_eq!(reply.kind, "hello");
        assert_eq!(reply.id.as_deref(), Some("1234"));
        let hello = reply.hello.unwrap();
        assert_eq!(hello.sessionid, session.public_id());
        assert_eq!(hello.resumeid, session.resume_id());
        assert_eq!(hello.userid, "alice");
        assert!(hello.server.is_some());
    }

    #[tokio::test]
    async fn hello_with_unknown_user_fails() {
        let (hub, _, _rx) = make_hub();
        let (client, mut rx) = ClientHandle::for_tests(64);

        let mut message = hello_message("alice");
        message.hello.as_mut().unwrap().auth.as_mut().unwrap().params = json!({});
        assert!(hub.process_hello(&client, &message).await.is_none());

        let reply = recv_message(&mut rx);
        assert_eq!(reply.kind, "error");
        assert_eq!(reply.error.unwrap().code, "auth_failed");
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn session_limit_is_enforced_per_backend() {
        let (hub, backend, events_rx) = make_hub();
        let config = Arc::new(Config {
            session_limit: 1,
            session_secret: "test-session-secret".to_string(),
            ..Config::default()
        });
        drop((hub, events_rx));
        let (events, _rx) = LoopbackEvents::new();
        let hub = Hub::new(config, backend, events, Arc::new(TokenKeyStore::empty()));

        let (client_a, _rx_a) = ClientHandle::for_tests(64);
        assert!(hub
            .process_hello(&client_a, &hello_message("alice"))
            .await
            .is_some());

        let (client_b, mut rx_b) = ClientHandle::for_tests(64);
        assert!(hub
            .process_hello(&client_b, &hello_message("bob"))
            .await
            .is_none());
        let reply = recv_message(&mut rx_b);
        assert_eq!(reply.error.unwrap().code, "session_limit_exceeded");
    }

    #[tokio::test]
    async fn resume_rebinds_session() {
        let (hub, _, _events) = make_hub();
        let (session, rx) = connect(&hub, "alice").await;
        let resume_id = session.resume_id().to_string();
        let public_id = session.public_id().to_string();

        // Socket drops.
        let client = session.client().unwrap();
        drop(rx);
        hub.client_gone(&session, &client);
        assert!(session.detached_since().is_some());

        // New socket resumes.
        let (new_client, mut new_rx) = ClientHandle::for_tests(64);
        let resume = ClientMessage {
            id: Some("5678".to_string()),
            kind: "hello".to_string(),
            hello: Some(HelloClientMessage {
                version: "1.0".to_string(),
                resumeid: Some(resume_id),
                ..Default::default()
            }),
            ..Default::default()
        };
        let resumed = hub.process_hello(&new_client, &resume).await.unwrap();
        assert_eq!(resumed.id(), session.id());
        assert!(resumed.detached_since().is_none());

        let reply = recv_message(&mut new_rx);
        assert_eq!(reply.hello.unwrap().sessionid, public_id);
    }

    #[tokio::test]
    async fn resume_with_unknown_id_fails() {
        let (hub, _, _events) = make_hub();
        let (client, mut rx) = ClientHandle::for_tests(64);
        let resume = ClientMessage {
            kind: "hello".to_string(),
            hello: Some(HelloClientMessage {
                version: "1.0".to_string(),
                resumeid: Some("bogus".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(hub.process_hello(&client, &resume).await.is_none());
        let reply = recv_message(&mut rx);
        assert_eq!(reply.error.unwrap().code, "no_such_session");
    }

    #[tokio::test]
    async fn lookup_public_id_roundtrip() {
        let (hub, _, _events) = make_hub();
        let (session, _rx) = connect(&hub, "alice").await;

        let found = hub.lookup_public_id(session.public_id()).unwrap();
        assert_eq!(found.id(), session.id());

        assert!(hub.lookup_public_id("garbage").is_none());

        // Cached decode agrees with the first one.
        let again = hub.lookup_public_id(session.public_id()).unwrap();
        assert_eq!(again.id(), session.id());
    }

    #[tokio::test]
    async fn join_and_leave_room() {
        let (hub, _, _events) = make_hub();
        let (session, mut rx) = connect(&hub, "alice").await;

        hub.process_room(
            &session,
            Some("ABCD".to_string()),
            &RoomClientMessage {
                roomid: "r1".to_string(),
                sessionid: Some("room-session-1".to_string()),
            },
        )
        .await;

        let ack = recv_message(&mut rx);
        assert_eq!(ack.kind, "room");
        assert_eq!(ack.id.as_deref(), Some("ABCD"));
        assert_eq!(ack.room.unwrap().roomid, "r1");

        let join = recv_message(&mut rx);
        assert_eq!(join.event.unwrap().kind, "join");
        let snapshot = recv_message(&mut rx);
        assert_eq!(snapshot.transient_data.unwrap().kind, "initial");

        assert_eq!(hub.room_count(), 1);
        assert_eq!(session.room_id().as_deref(), Some("r1"));

        // Joining the same room again fails.
        hub.process_room(
            &session,
            None,
            &RoomClientMessage {
                roomid: "r1".to_string(),
                sessionid: None,
            },
        )
        .await;
        let err = recv_message(&mut rx);
        assert_eq!(err.error.unwrap().code, "already_joined");

        // An empty room id leaves the room; the empty room is collected.
        hub.process_room(
            &session,
            None,
            &RoomClientMessage {
                roomid: String::new(),
                sessionid: None,
            },
        )
        .await;
        let ack = recv_message(&mut rx);
        assert_eq!(ack.kind, "room");
        assert_eq!(ack.room.unwrap().roomid, "");
        assert!(session.room_id().is_none());
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn denied_room_join_fails() {
        let (hub, backend, _events) = make_hub();
        backend.deny_room("secret");
        let (session, mut rx) = connect(&hub, "alice").await;

        hub.process_room(
            &session,
            None,
            &RoomClientMessage {
                roomid: "secret".to_string(),
                sessionid: None,
            },
        )
        .await;
        let reply = recv_message(&mut rx);
        assert_eq!(reply.error.unwrap().code, "room_join_failed");
        assert!(session.room_id().is_none());
    }

    #[tokio::test]
    async fn switching_rooms_leaves_the_old_one() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx_a) = connect(&hub, "alice").await;
        let (bob, mut rx_b) = connect(&hub, "bob").await;

        for session in [&alice, &bob] {
            hub.process_room(
                session,
                None,
                &RoomClientMessage {
                    roomid: "r1".to_string(),
                    sessionid: None,
                },
            )
            .await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.process_room(
            &bob,
            None,
            &RoomClientMessage {
                roomid: "r2".to_string(),
                sessionid: None,
            },
        )
        .await;

        // Alice sees bob leave r1.
        let leave = recv_message(&mut rx_a);
        let event = leave.event.unwrap();
        assert_eq!(event.kind, "leave");
        assert_eq!(event.leave.unwrap()[0], bob.public_id());
        assert_eq!(bob.room_id().as_deref(), Some("r2"));
        assert_eq!(hub.room_count(), 2);
    }

    #[tokio::test]
    async fn message_to_session_is_stamped_and_delivered() {
        let (hub, _, _events) = make_hub();
        let (alice, _rx_a) = connect(&hub, "alice").await;
        let (bob, mut rx_b) = connect(&hub, "bob").await;

        hub.process_message(
            &alice,
            Some("abcd".to_string()),
            &MessageClientMessage {
                recipient: crate::messages::MessageClientMessageRecipient {
                    recipient_type: "session".to_string(),
                    sessionid: Some(bob.public_id().to_string()),
                    userid: None,
                },
                data: json!({"sdp": "..."}),
            },
            false,
        )
        .await;

        let received = recv_message(&mut rx_b);
        assert_eq!(received.kind, "message");
        let inner = received.message.unwrap();
        assert_eq!(inner.sender.sessionid, alice.public_id());
        assert_eq!(inner.sender.userid, "alice");
        assert_eq!(inner.data["sdp"], "...");
    }

    #[tokio::test]
    async fn message_to_unknown_session_reports_client_not_found() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx) = connect(&hub, "alice").await;

        hub.process_message(
            &alice,
            Some("abcd".to_string()),
            &MessageClientMessage {
                recipient: crate::messages::MessageClientMessageRecipient {
                    recipient_type: "session".to_string(),
                    sessionid: Some("not-a-session".to_string()),
                    userid: None,
                },
                data: json!({}),
            },
            false,
        )
        .await;

        let reply = recv_message(&mut rx);
        assert_eq!(reply.error.unwrap().code, "client_not_found");
    }

    #[tokio::test]
    async fn message_to_user_reaches_all_their_sessions() {
        let (hub, _, _events) = make_hub();
        let (alice, _rx_a) = connect(&hub, "alice").await;
        let (_bob1, mut rx_b1) = connect(&hub, "bob").await;
        let (_bob2, mut rx_b2) = connect(&hub, "bob").await;

        hub.process_message(
            &alice,
            None,
            &MessageClientMessage {
                recipient: crate::messages::MessageClientMessageRecipient {
                    recipient_type: "user".to_string(),
                    sessionid: None,
                    userid: Some("bob".to_string()),
                },
                data: json!({"hi": true}),
            },
            false,
        )
        .await;

        assert_eq!(recv_message(&mut rx_b1).kind, "message");
        assert_eq!(recv_message(&mut rx_b2).kind, "message");
    }

    #[tokio::test]
    async fn control_requires_permission() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx_a) = connect(&hub, "alice").await;
        let (bob, _rx_b) = connect(&hub, "bob").await;

        alice.set_permissions(vec![Permission::PublishMedia]);
        hub.process_message(
            &alice,
            Some("c1".to_string()),
            &MessageClientMessage {
                recipient: crate::messages::MessageClientMessageRecipient {
                    recipient_type: "session".to_string(),
                    sessionid: Some(bob.public_id().to_string()),
                    userid: None,
                },
                data: json!({"action": "mute"}),
            },
            true,
        )
        .await;

        let reply = recv_message(&mut rx_a);
        assert_eq!(reply.error.unwrap().code, "permission_denied");
    }

    #[tokio::test]
    async fn incall_room_request_coalesces_to_all_update() {
        let (hub, _, _events) = make_hub();
        let mut rxs = Vec::new();
        for user in ["u1", "u2", "u3"] {
            let (session, mut rx) = connect(&hub, user).await;
            hub.process_room(
                &session,
                None,
                &RoomClientMessage {
                    roomid: "r1".to_string(),
                    sessionid: None,
                },
            )
            .await;
            drain(&mut rx);
            rxs.push((session, rx));
        }
        for (_, rx) in rxs.iter_mut() {
            drain(rx);
        }

        hub.deliver_async(
            AsyncTarget::Room {
                backend_url: BACKEND_URL.to_string(),
                room_id: "r1".to_string(),
            },
            AsyncMessage::room(BackendRoomRequest {
                kind: "incall".to_string(),
                roomid: "r1".to_string(),
                backend_url: BACKEND_URL.to_string(),
                incall: Some(7),
                ..Default::default()
            }),
        );

        for (_, rx) in rxs.iter_mut() {
            let msg = recv_message(rx);
            let update = msg.event.unwrap().update.unwrap();
            assert_eq!(update.all, Some(true));
            assert_eq!(update.incall, Some(7));
            assert_eq!(update.roomid, "r1");
            assert!(rx.try_recv().is_err(), "expected exactly one update");
        }
    }

    #[tokio::test]
    async fn disinvite_removes_user_sessions_from_room() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx_a) = connect(&hub, "alice").await;
        let (bob, mut rx_b) = connect(&hub, "bob").await;
        for session in [&alice, &bob] {
            hub.process_room(
                session,
                None,
                &RoomClientMessage {
                    roomid: "r1".to_string(),
                    sessionid: None,
                },
            )
            .await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.deliver_async(
            AsyncTarget::Room {
                backend_url: BACKEND_URL.to_string(),
                room_id: "r1".to_string(),
            },
            AsyncMessage::room(BackendRoomRequest {
                kind: "disinvite".to_string(),
                roomid: "r1".to_string(),
                backend_url: BACKEND_URL.to_string(),
                userids: Some(vec!["bob".to_string()]),
                ..Default::default()
            }),
        );

        let msg = recv_message(&mut rx_b);
        assert_eq!(msg.event.unwrap().kind, "disinvite");
        assert!(bob.room_id().is_none());

        // Alice sees bob leave.
        let leave = recv_message(&mut rx_a);
        assert_eq!(leave.event.unwrap().kind, "leave");
    }

    #[tokio::test]
    async fn bye_destroys_session_and_fans_out_leave() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx_a) = connect(&hub, "alice").await;
        let (bob, mut rx_b) = connect(&hub, "bob").await;
        for session in [&alice, &bob] {
            hub.process_room(
                session,
                None,
                &RoomClientMessage {
                    roomid: "r1".to_string(),
                    sessionid: None,
                },
            )
            .await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.process_bye(&bob, Some("9876".to_string()));

        let bye = recv_message(&mut rx_b);
        assert_eq!(bye.kind, "bye");
        assert_eq!(bye.id.as_deref(), Some("9876"));
        assert!(bob.is_closed());
        assert_eq!(hub.session_count(), 1);

        let leave = recv_message(&mut rx_a);
        assert_eq!(leave.event.unwrap().leave.unwrap()[0], bob.public_id());
    }

    #[tokio::test]
    async fn internal_hello_and_incall_flags() {
        let (hub, _, _events) = make_hub();
        let random = chorus_common::id::random_string(48);
        let token = crate::auth::internal_auth_token(&random, b"test-internal-secret");

        let (client, mut rx) = ClientHandle::for_tests(64);
        let message = ClientMessage {
            kind: "hello".to_string(),
            hello: Some(HelloClientMessage {
                version: "1.0".to_string(),
                auth: Some(crate::messages::HelloClientMessageAuth {
                    client_type: "internal".to_string(),
                    url: String::new(),
                    params: json!({
                        "random": random,
                        "token": token,
                        "backend": BACKEND_URL,
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let internal = hub.process_hello(&client, &message).await.unwrap();
        assert_eq!(internal.client_type(), ClientType::Internal);
        drain(&mut rx);

        hub.process_room(
            &internal,
            None,
            &RoomClientMessage {
                roomid: "r1".to_string(),
                sessionid: None,
            },
        )
        .await;
        drain(&mut rx);

        hub.process_internal(
            &internal,
            None,
            &InternalClientMessage {
                kind: "incall".to_string(),
                incall: Some(crate::messages::InCallInternalClientMessage { incall: 3 }),
            },
        );
        let msg = recv_message(&mut rx);
        let event = msg.event.unwrap();
        assert_eq!(event.kind, "flags");
        assert_eq!(event.flags.unwrap().incall, 3);
    }

    #[tokio::test]
    async fn regular_clients_cannot_send_internal_messages() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx) = connect(&hub, "alice").await;

        hub.process_internal(
            &alice,
            Some("x".to_string()),
            &InternalClientMessage {
                kind: "incall".to_string(),
                incall: Some(crate::messages::InCallInternalClientMessage { incall: 1 }),
            },
        );
        let reply = recv_message(&mut rx);
        assert_eq!(reply.error.unwrap().code, "permission_denied");
    }

    #[tokio::test]
    async fn transient_requires_room_permission() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx) = connect(&hub, "alice").await;
        hub.process_room(
            &alice,
            None,
            &RoomClientMessage {
                roomid: "r1".to_string(),
                sessionid: None,
            },
        )
        .await;
        drain(&mut rx);

        alice.set_permissions(vec![Permission::PublishMedia]);
        hub.process_transient(
            &alice,
            Some("t1".to_string()),
            &TransientDataClientMessage {
                kind: "set".to_string(),
                key: Some("k".to_string()),
                value: Some(json!(1)),
                ttl: None,
            },
        );
        let reply = recv_message(&mut rx);
        assert_eq!(reply.error.unwrap().code, "permission_denied");
    }

    #[tokio::test]
    async fn shutdown_sends_bye_and_clears_tables() {
        let (hub, _, _events) = make_hub();
        let (alice, mut rx) = connect(&hub, "alice").await;

        hub.shutdown();
        let bye = recv_message(&mut rx);
        assert_eq!(bye.kind, "bye");
        assert_eq!(bye.bye.unwrap().reason.as_deref(), Some("shutdown"));
        assert!(alice.is_closed());
        assert_eq!(hub.session_count(), 0);
    }
}
