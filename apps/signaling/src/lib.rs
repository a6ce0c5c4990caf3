pub mod async_message;
pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod federation;
pub mod hub;
pub mod ids;
pub mod messages;
pub mod permissions;
pub mod room;
pub mod server;
pub mod session;
pub mod transient;
pub mod watcher;

use std::sync::Arc;

use hub::Hub;

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}
