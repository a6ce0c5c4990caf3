//! Shared harness: starts the signaling server on an ephemeral port and
//! provides a WebSocket test client speaking the wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chorus_signaling::auth::TokenKeyStore;
use chorus_signaling::backend::MemoryBackend;
use chorus_signaling::config::Config;
use chorus_signaling::federation::LoopbackEvents;
use chorus_signaling::hub::Hub;
use chorus_signaling::messages::{
    ClientMessage, HelloClientMessage, HelloClientMessageAuth, MessageClientMessage,
    MessageClientMessageRecipient, RoomClientMessage, ServerMessage, TransientDataClientMessage,
};
use chorus_signaling::{server, AppState};

pub const BACKEND_URL: &str = "https://backend.example/ocs";

/// How long to wait for an expected message.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
    pub backend: Arc<MemoryBackend>,
}

/// Start a server with the in-memory backend and loopback federation.
pub async fn start_server() -> TestServer {
    start_server_with_config(Config {
        session_secret: "test-session-secret".to_string(),
        internal_secret: "test-internal-secret".to_string(),
        ..Config::default()
    })
    .await
}

pub async fn start_server_with_config(config: Config) -> TestServer {
    let backend = Arc::new(MemoryBackend::new());
    let (events, federation_rx) = LoopbackEvents::new();
    let hub = Hub::new(
        Arc::new(config),
        backend.clone(),
        events,
        Arc::new(TokenKeyStore::empty()),
    );
    let _tasks = hub.start(federation_rx);

    let app = server::router().with_state(AppState { hub: hub.clone() });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        hub,
        backend,
    }
}

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Public session id, set after a successful hello.
    pub public_id: String,
    pub resume_id: String,
}

impl TestClient {
    /// Connect and consume the `welcome` message.
    pub async fn connect(server: &TestServer) -> Self {
        let mut client = Self::connect_raw(server.addr).await;
        let welcome = client.recv().await;
        assert_eq!(welcome.kind, "welcome");
        assert!(welcome.welcome.unwrap().features.len() > 1);
        client
    }

    /// Connect without reading anything.
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let url = format!("ws://{addr}/spreed");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("ws connect");
        Self {
            ws,
            public_id: String::new(),
            resume_id: String::new(),
        }
    }

    pub async fn send(&mut self, message: &ClientMessage) {
        let json = serde_json::to_string(message).expect("client message serializes");
        self.send_raw(json).await;
    }

    /// Send a raw text frame, bypassing the message types.
    pub async fn send_raw(&mut self, text: String) {
        self.ws
            .send(tungstenite::Message::Text(text.into()))
            .await
            .expect("ws send");
    }

    /// Receive the next protocol message, skipping transport frames.
    pub async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("connection closed")
                .expect("ws read error");
            match frame {
                tungstenite::Message::Text(text) => {
                    return serde_json::from_str(&text).expect("server message parses");
                }
                tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
                tungstenite::Message::Close(frame) => {
                    panic!("connection closed while waiting for a message: {frame:?}")
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Assert that nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        let deadline = time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return,
                frame = self.ws.next() => {
                    match frame {
                        Some(Ok(tungstenite::Message::Ping(_)))
                        | Some(Ok(tungstenite::Message::Pong(_))) => continue,
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            panic!("expected silence, got {text}")
                        }
                        // Transport-level teardown is not a protocol message.
                        _ => return,
                    }
                }
            }
        }
    }

    /// Wait for a close frame (or the stream ending).
    pub async fn expect_close(&mut self) {
        loop {
            match time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(tungstenite::Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return,
            }
        }
    }

    // -- protocol helpers --------------------------------------------------

    pub fn hello_v1(user_id: &str) -> ClientMessage {
        ClientMessage {
            id: Some("1234".to_string()),
            kind: "hello".to_string(),
            hello: Some(HelloClientMessage {
                version: "1.0".to_string(),
                auth: Some(HelloClientMessageAuth {
                    client_type: String::new(),
                    url: BACKEND_URL.to_string(),
                    params: json!({"userid": user_id}),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Send a v1 hello and wait for the reply, capturing the session ids.
    pub async fn run_hello(&mut self, user_id: &str) {
        self.send(&Self::hello_v1(user_id)).await;
        let reply = self.recv().await;
        assert_eq!(reply.kind, "hello", "unexpected reply: {reply:?}");
        assert_eq!(reply.id.as_deref(), Some("1234"));
        let hello = reply.hello.expect("hello payload");
        assert_eq!(hello.userid, user_id);
        self.public_id = hello.sessionid;
        self.resume_id = hello.resumeid;
    }

    /// Resume a previous session on this connection.
    pub async fn run_resume(&mut self, resume_id: &str) -> ServerMessage {
        self.send(&ClientMessage {
            id: Some("5678".to_string()),
            kind: "hello".to_string(),
            hello: Some(HelloClientMessage {
                version: "1.0".to_string(),
                resumeid: Some(resume_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await;
        let reply = self.recv().await;
        if reply.kind == "hello" {
            let hello = reply.hello.clone().expect("hello payload");
            self.public_id = hello.sessionid;
            self.resume_id = hello.resumeid;
        }
        reply
    }

    /// Join a room and wait for the ack.
    pub async fn join_room(&mut self, room_id: &str) -> ServerMessage {
        self.send(&ClientMessage {
            id: Some("ABCD".to_string()),
            kind: "room".to_string(),
            room: Some(RoomClientMessage {
                roomid: room_id.to_string(),
                sessionid: Some(format!("{room_id}-{}", self.public_id)),
            }),
            ..Default::default()
        })
        .await;
        let reply = self.recv().await;
        assert_eq!(reply.kind, "room", "unexpected reply: {reply:?}");
        assert_eq!(reply.id.as_deref(), Some("ABCD"));
        reply
    }

    /// Wait for a room join event and return the public session ids it lists.
    pub async fn recv_join(&mut self) -> Vec<String> {
        let message = self.recv().await;
        assert_eq!(message.kind, "event", "unexpected message: {message:?}");
        let event = message.event.expect("event payload");
        assert_eq!(event.target, "room");
        assert_eq!(event.kind, "join");
        event
            .join
            .expect("join entries")
            .into_iter()
            .map(|entry| entry.sessionid)
            .collect()
    }

    /// Wait for the transient-data snapshot delivered after a join.
    pub async fn recv_initial_transient(&mut self) -> serde_json::Map<String, Value> {
        let message = self.recv().await;
        let transient = message.transient_data.expect("transient payload");
        assert_eq!(transient.kind, "initial");
        transient.data.unwrap_or_default()
    }

    /// Wait for a room leave event and return the listed session ids.
    pub async fn recv_leave(&mut self) -> Vec<String> {
        let message = self.recv().await;
        assert_eq!(message.kind, "event", "unexpected message: {message:?}");
        let event = message.event.expect("event payload");
        assert_eq!(event.target, "room");
        assert_eq!(event.kind, "leave");
        event.leave.expect("leave entries")
    }

    pub fn message_to_session(public_id: &str, data: Value) -> ClientMessage {
        ClientMessage {
            id: Some("abcd".to_string()),
            kind: "message".to_string(),
            message: Some(MessageClientMessage {
                recipient: MessageClientMessageRecipient {
                    recipient_type: "session".to_string(),
                    sessionid: Some(public_id.to_string()),
                    userid: None,
                },
                data,
            }),
            ..Default::default()
        }
    }

    pub fn message_to_room(data: Value) -> ClientMessage {
        ClientMessage {
            id: Some("abcd".to_string()),
            kind: "message".to_string(),
            message: Some(MessageClientMessage {
                recipient: MessageClientMessageRecipient {
                    recipient_type: "room".to_string(),
                    sessionid: None,
                    userid: None,
                },
                data,
            }),
            ..Default::default()
        }
    }

    pub fn set_transient(key: &str, value: Value, ttl: Option<u64>) -> ClientMessage {
        ClientMessage {
            id: Some("efgh".to_string()),
            kind: "transient".to_string(),
            transient_data: Some(TransientDataClientMessage {
                kind: "set".to_string(),
                key: Some(key.to_string()),
                value: Some(value),
                ttl,
            }),
            ..Default::default()
        }
    }

    pub fn remove_transient(key: &str) -> ClientMessage {
        ClientMessage {
            id: Some("ijkl".to_string()),
            kind: "transient".to_string(),
            transient_data: Some(TransientDataClientMessage {
                kind: "remove".to_string(),
                key: Some(key.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn bye() -> ClientMessage {
        ClientMessage {
            id: Some("9876".to_string()),
            kind: "bye".to_string(),
            bye: Some(Default::default()),
            ..Default::default()
        }
    }

    /// Drop the connection without saying bye.
    pub async fn abandon(mut self) {
        let _ = self.ws.close(None).await;
    }
}
