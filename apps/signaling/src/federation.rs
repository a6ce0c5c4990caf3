//! Transport for async envelopes between server instances.
//!
//! The hub publishes envelopes for sessions it does not host and consumes a
//! feed of envelopes addressed to its own sessions and rooms. A clustered
//! deployment would back this with a message bus; a single instance uses the
//! in-process loopback, which also keeps the cross-node code path exercised
//! in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::async_message::AsyncMessage;

#[derive(Debug)]
pub enum FederationError {
    /// The transport is shut down.
    Closed,
    /// The transport failed to deliver.
    Transport(String),
}

impl std::fmt::Display for FederationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "federation transport closed"),
            Self::Transport(msg) => write!(f, "federation transport error: {msg}"),
        }
    }
}

impl std::error::Error for FederationError {}

/// Addressing for a published envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncTarget {
    /// The instance hosting the session with this public id.
    Session(String),
    /// Every instance serving the room.
    Room {
        backend_url: String,
        room_id: String,
    },
    /// Every instance hosting sessions of the user.
    User {
        backend_url: String,
        user_id: String,
    },
}

#[async_trait]
pub trait AsyncEvents: Send + Sync {
    async fn publish(
        &self,
        target: AsyncTarget,
        message: AsyncMessage,
    ) -> Result<(), FederationError>;
}

/// In-process transport feeding the local hub's federation-receive task.
pub struct LoopbackEvents {
    tx: mpsc::UnboundedSender<(AsyncTarget, AsyncMessage)>,
}

impl LoopbackEvents {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(AsyncTarget, AsyncMessage)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl AsyncEvents for LoopbackEvents {
    async fn publish(
        &self,
        target: AsyncTarget,
        message: AsyncMessage,
    ) -> Result<(), FederationError> {
        self.tx
            .send((target, message))
            .map_err(|_| FederationError::Closed)
    }
}
