//! WebSocket upgrade handler and the per-connection read pump.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use tokio::time;

use crate::client::{run_write_pump, ClientHandle};
use crate::messages::{ClientMessage, ServerMessage, MAX_MESSAGE_SIZE};
use crate::session::Session;
use crate::AppState;

/// Time a connection gets to send a valid `hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router() -> Router<AppState> {
    Router::new().route("/spreed", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}

async fn handle_connection(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (client, outbound_rx) = ClientHandle::new(Some(addr));
    let writer = tokio::spawn(run_write_pump(ws_tx, outbound_rx, client.clone()));

    tracing::debug!(%addr, client_id = client.id(), "connection established");
    let _ = client.try_send(Arc::new(ServerMessage::welcome()));

    let mut session: Option<Arc<Session>> = None;

    loop {
        // Unauthenticated connections only get a short grace period.
        let frame = if session.is_none() {
            match time::timeout(HELLO_TIMEOUT, ws_rx.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    tracing::debug!(client_id = client.id(), "hello timeout");
                    break;
                }
            }
        } else {
            ws_rx.next().await
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                tracing::debug!(client_id = client.id(), ?err, "read error");
                break;
            }
            None => break,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => {
                if let Some(session) = &session {
                    session.touch();
                }
                continue;
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                let _ = client.try_send(Arc::new(ServerMessage::error(
                    None,
                    crate::error::Error::invalid_format(),
                )));
                continue;
            }
        };

        if text.len() > MAX_MESSAGE_SIZE {
            let _ = client.try_send(Arc::new(ServerMessage::error(
                None,
                crate::error::Error::message_too_long(MAX_MESSAGE_SIZE),
            )));
            continue;
        }

        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(client_id = client.id(), %err, "invalid json frame");
                let _ = client.try_send(Arc::new(ServerMessage::error(
                    None,
                    crate::error::Error::invalid_format(),
                )));
                continue;
            }
        };
        if let Err(error) = parsed.check_valid() {
            let reply = ServerMessage::error(parsed.id.clone(), error);
            match &session {
                Some(session) => {
                    session.send(reply);
                }
                None => {
                    let _ = client.try_send(Arc::new(reply));
                }
            }
            continue;
        }

        match &session {
            None => {
                if parsed.kind == "hello" {
                    session = state.hub.process_hello(&client, &parsed).await;
                } else {
                    let _ = client.try_send(Arc::new(ServerMessage::error(
                        parsed.id.clone(),
                        crate::error::Error::hello_expected(),
                    )));
                }
            }
            Some(current) => {
                current.touch();
                let id = parsed.id.clone();
                match parsed.kind.as_str() {
                    "hello" => {
                        // The connection is already bound to a session.
                        current.send(ServerMessage::error(
                            id,
                            crate::error::Error::invalid_message("already authenticated"),
                        ));
                    }
                    "bye" => {
                        state.hub.process_bye(current, id);
                        break;
                    }
                    "room" => {
                        if let Some(room) = &parsed.room {
                            state.hub.process_room(current, id, room).await;
                        }
                    }
                    "message" => {
                        if let Some(message) = &parsed.message {
                            state.hub.process_message(current, id, message, false).await;
                        }
                    }
                    "control" => {
                        if let Some(control) = &parsed.control {
                            state
                                .hub
                                .process_message(current, id, &control.message, true)
                                .await;
                        }
                    }
                    "internal" => {
                        if let Some(internal) = &parsed.internal {
                            state.hub.process_internal(current, id, internal);
                        }
                    }
                    "transient" => {
                        if let Some(transient) = &parsed.transient_data {
                            state.hub.process_transient(current, id, transient);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    // Socket gone: detach so the session stays resumable; destruction is the
    // expiry sweep's job.
    if let Some(session) = &session {
        if !session.is_closed() {
            state.hub.client_gone(session, &client);
        }
    }
    client.request_close();
    let _ = writer.await;
    tracing::debug!(client_id = client.id(), "connection closed");
}
