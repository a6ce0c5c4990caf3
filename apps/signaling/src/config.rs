use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the WebSocket endpoint binds to.
    pub listen_addr: SocketAddr,
    /// Shared secret for signing backend requests.
    pub backend_secret: String,
    /// Shared secret internal clients authenticate with.
    pub internal_secret: String,
    /// Secret for the public session id codec. Generated at startup when
    /// unset, which also invalidates resumes across restarts.
    pub session_secret: String,
    /// Hello-v2 public key files as `name=path` pairs.
    pub token_key_files: Vec<(String, PathBuf)>,
    /// How long an attached session may stay silent before it is closed.
    pub session_timeout: Duration,
    /// How long a detached session stays resumable.
    pub resume_window: Duration,
    /// Interval of the heartbeat ticker.
    pub heartbeat_interval: Duration,
    /// Deadline for backend HTTP requests.
    pub backend_timeout: Duration,
    /// Maximum concurrent sessions per backend; 0 is unlimited.
    pub session_limit: usize,
    /// Deduplication interval for file-watch events.
    pub dedup_watch_events: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 8080).into(),
            backend_secret: String::new(),
            internal_secret: String::new(),
            session_secret: String::new(),
            token_key_files: Vec::new(),
            session_timeout: Duration::from_secs(30),
            resume_window: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            backend_timeout: Duration::from_secs(10),
            session_limit: 0,
            dedup_watch_events: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults and warning about values that do not parse.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "invalid LISTEN_ADDR, using default"),
            }
        }

        if let Ok(secret) = std::env::var("BACKEND_SECRET") {
            config.backend_secret = secret;
        }
        if let Ok(secret) = std::env::var("INTERNAL_SECRET") {
            config.internal_secret = secret;
        }
        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            config.session_secret = secret;
        }
        if config.session_secret.is_empty() {
            tracing::warn!("SESSION_SECRET not set, using a random secret; resumes will not survive a restart");
            config.session_secret = chorus_common::id::random_token(32);
        }

        if let Ok(keys) = std::env::var("TOKEN_KEYS") {
            config.token_key_files = parse_token_keys(&keys);
        }

        secs_var("SESSION_TIMEOUT_SECS", &mut config.session_timeout);
        secs_var("RESUME_WINDOW_SECS", &mut config.resume_window);
        secs_var("HEARTBEAT_INTERVAL_SECS", &mut config.heartbeat_interval);
        secs_var("BACKEND_TIMEOUT_SECS", &mut config.backend_timeout);

        if let Ok(value) = std::env::var("SESSION_LIMIT") {
            match value.parse() {
                Ok(limit) => config.session_limit = limit,
                Err(_) => tracing::warn!(%value, "invalid SESSION_LIMIT, using default"),
            }
        }

        if let Ok(value) = std::env::var("DEDUPLICATE_WATCH_EVENTS_MS") {
            match value.parse() {
                Ok(ms) => config.dedup_watch_events = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(%value, "invalid DEDUPLICATE_WATCH_EVENTS_MS, using default")
                }
            }
        }

        config
    }
}

fn secs_var(name: &str, target: &mut Duration) {
    if let Ok(value) = std::env::var(name) {
        match value.parse::<u64>() {
            Ok(secs) => *target = Duration::from_secs(secs),
            Err(_) => tracing::warn!(var = name, %value, "invalid duration, using default"),
        }
    }
}

/// Parse `name=path` pairs separated by commas.
fn parse_token_keys(raw: &str) -> Vec<(String, PathBuf)> {
    let mut files = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((name, path)) if !name.is_empty() && !path.is_empty() => {
                files.push((name.to_string(), PathBuf::from(path)));
            }
            _ => tracing::warn!(entry = %part, "invalid TOKEN_KEYS entry, expected name=path"),
        }
    }
    files
}
