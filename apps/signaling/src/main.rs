use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus_signaling::auth::{watch_token_keys, TokenKeyStore};
use chorus_signaling::backend::HttpBackend;
use chorus_signaling::config::Config;
use chorus_signaling::federation::LoopbackEvents;
use chorus_signaling::hub::Hub;
use chorus_signaling::{server, watcher, AppState};

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    if config.backend_secret.is_empty() {
        tracing::warn!("BACKEND_SECRET not set, backend requests are unsigned");
    }

    watcher::set_deduplicate_watch_events(config.dedup_watch_events);

    let token_keys = Arc::new(
        TokenKeyStore::new(config.token_key_files.clone()).expect("failed to load token keys"),
    );
    let mut key_watchers = Vec::new();
    watch_token_keys(token_keys.clone(), &mut key_watchers);

    let backend = Arc::new(
        HttpBackend::new(config.backend_secret.as_bytes(), config.backend_timeout)
            .expect("failed to create backend client"),
    );

    let (events, federation_rx) = LoopbackEvents::new();
    let hub = Hub::new(config.clone(), backend, events, token_keys);
    let tasks = hub.start(federation_rx);

    let app = server::router()
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { hub: hub.clone() });

    tracing::info!(addr = %config.listen_addr, "signaling server listening");
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind");

    let shutdown_hub = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("shutting down");
        shutdown_hub.shutdown();
    })
    .await
    .expect("server error");

    drop(key_watchers);
    for task in tasks {
        task.abort();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
