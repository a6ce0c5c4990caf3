//! Per-socket connection state and the outbound write pump.
//!
//! Each socket gets a read pump (the connection handler in `server`) and a
//! write pump, joined by a bounded queue. Senders never block: a full queue
//! surfaces as an overflow so the hub can close the slow session instead of
//! stalling the sender.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use chorus_common::id;

use crate::messages::ServerMessage;

/// Bound of the per-connection outbound queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Normal closure, RFC 6455.
const CLOSE_CODE_NORMAL: u16 = 1000;

#[derive(Debug)]
pub enum OutboundItem {
    Message(Arc<ServerMessage>),
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The queue is full; the consumer is too slow.
    Full,
    /// A close was already requested; writes now fail.
    Closed,
}

/// Handle for queueing frames to one connection. Cheap to clone via `Arc`;
/// the matching receiver is owned by the write pump.
pub struct ClientHandle {
    id: String,
    addr: Option<SocketAddr>,
    tx: mpsc::Sender<OutboundItem>,
    close_requested: AtomicBool,
    close_notify: Notify,
}

impl ClientHandle {
    pub fn new(addr: Option<SocketAddr>) -> (Arc<Self>, mpsc::Receiver<OutboundItem>) {
        Self::with_capacity(addr, OUTBOUND_QUEUE_SIZE)
    }

    fn with_capacity(
        addr: Option<SocketAddr>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Arc::new(Self {
            id: id::prefixed_ulid(id::prefix::CONNECTION),
            addr,
            tx,
            close_requested: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        (handle, rx)
    }

    /// A handle with a small queue and no socket, for unit tests.
    pub fn for_tests(capacity: usize) -> (Arc<Self>, mpsc::Receiver<OutboundItem>) {
        Self::with_capacity(None, capacity)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Queue a message without blocking.
    pub fn try_send(&self, message: Arc<ServerMessage>) -> Result<(), SendError> {
        if self.close_requested.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(OutboundItem::Message(message))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Queue a ping frame; a full queue is fine, the client is busy anyway.
    pub fn try_ping(&self) {
        if self.close_requested.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.try_send(OutboundItem::Ping);
    }

    /// Ask the write pump to flush queued messages, send a close frame, and
    /// exit. Subsequent writes fail with [`SendError::Closed`].
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }

    pub fn is_close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent close is not lost.
        notified.as_mut().enable();
        if self.is_close_requested() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Serialize queued messages onto the socket until the connection goes away
/// or a close is requested.
pub async fn run_write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundItem>,
    handle: Arc<ClientHandle>,
) {
    loop {
        tokio::select! {
            item = rx.recv() => {
                match item {
                    Some(item) => {
                        if write_item(&mut ws_tx, item).await.is_err() {
                            return;
                        }
                    }
                    // All senders gone: the connection is being torn down.
                    None => break,
                }
            }
            _ = handle.closed() => {
                // Flush whatever was queued before the close was requested.
                while let Ok(item) = rx.try_recv() {
                    if write_item(&mut ws_tx, item).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    let frame = CloseFrame {
        code: CLOSE_CODE_NORMAL,
        reason: Default::default(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
}

async fn write_item(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    item: OutboundItem,
) -> Result<(), axum::Error> {
    match item {
        OutboundItem::Message(message) => {
            let json = serde_json::to_string(message.as_ref()).expect("server message serializes");
            ws_tx.send(Message::Text(json.into())).await
        }
        OutboundItem::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
    }
}
