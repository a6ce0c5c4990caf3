//! Hello authentication that does not involve the backend: v2 JWTs verified
//! against locally configured public keys, and the HMAC handshake used by
//! internal clients.
//!
//! The key set is loaded from PEM files into an immutable snapshot; reload
//! builds a complete new snapshot and swaps it wholesale, so verification
//! never observes a partially loaded set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// Clock skew tolerated when checking token lifetimes (seconds).
const TOKEN_LEEWAY_SECS: i64 = 60;

/// Minimum length of the random string in internal auth requests.
const MIN_INTERNAL_RANDOM_LEN: usize = 32;

/// Claims of a hello v2 token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloV2TokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata: Option<Value>,
}

/// Key families a token key can belong to, matched against the token
/// header's algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Rsa,
    Ecdsa,
    Ed25519,
}

impl KeyKind {
    fn matches(self, alg: Algorithm) -> bool {
        match self {
            KeyKind::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyKind::Ecdsa => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
            KeyKind::Ed25519 => matches!(alg, Algorithm::EdDSA),
        }
    }
}

struct TokenKey {
    id: String,
    kind: KeyKind,
    decoding: DecodingKey,
}

fn parse_public_key_pem(pem: &[u8]) -> Option<(KeyKind, DecodingKey)> {
    if let Ok(key) = DecodingKey::from_rsa_pem(pem) {
        return Some((KeyKind::Rsa, key));
    }
    if let Ok(key) = DecodingKey::from_ec_pem(pem) {
        return Some((KeyKind::Ecdsa, key));
    }
    if let Ok(key) = DecodingKey::from_ed_pem(pem) {
        return Some((KeyKind::Ed25519, key));
    }
    None
}

/// The hello-v2 public keys, reloadable at runtime without restart.
pub struct TokenKeyStore {
    files: Vec<(String, PathBuf)>,
    keys: RwLock<Arc<Vec<TokenKey>>>,
}

impl TokenKeyStore {
    /// Load the configured key files. Any unreadable or unparsable file is an
    /// error at startup.
    pub fn new(files: Vec<(String, PathBuf)>) -> Result<Self, String> {
        let keys = Self::load(&files, false)?;
        let store = Self {
            files,
            keys: RwLock::new(Arc::new(keys)),
        };
        Ok(store)
    }

    /// An empty store that accepts no hello-v2 tokens.
    pub fn empty() -> Self {
        Self {
            files: Vec::new(),
            keys: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn load(files: &[(String, PathBuf)], ignore_errors: bool) -> Result<Vec<TokenKey>, String> {
        let mut keys = Vec::with_capacity(files.len());
        for (id, path) in files {
            let pem = match std::fs::read(path) {
                Ok(pem) => pem,
                Err(err) => {
                    if !ignore_errors {
                        return Err(format!(
                            "could not read public key from {}: {err}",
                            path.display()
                        ));
                    }
                    tracing::warn!(key = %id, path = %path.display(), %err, "could not read public key, ignoring");
                    continue;
                }
            };
            match parse_public_key_pem(&pem) {
                Some((kind, decoding)) => keys.push(TokenKey {
                    id: id.clone(),
                    kind,
                    decoding,
                }),
                None => {
                    if !ignore_errors {
                        return Err(format!(
                            "could not parse public key from {}",
                            path.display()
                        ));
                    }
                    tracing::warn!(key = %id, path = %path.display(), "could not parse public key, ignoring");
                }
            }
        }
        if keys.is_empty() {
            tracing::warn!("no hello-v2 token keys loaded");
        } else {
            let mut ids: Vec<&str> = keys.iter().map(|k| k.id.as_str()).collect();
            ids.sort_unstable();
            tracing::info!(keys = ?ids, "enabled hello-v2 token keys");
        }
        Ok(keys)
    }

    /// Re-read the key files, keeping whatever still loads. Called from the
    /// file-watcher callback.
    pub fn reload(&self) {
        match Self::load(&self.files, true) {
            Ok(keys) => *self.keys.write() = Arc::new(keys),
            Err(err) => tracing::error!(%err, "error reloading token keys"),
        }
    }

    /// Paths to watch for hot reload.
    pub fn watched_files(&self) -> Vec<PathBuf> {
        self.files.iter().map(|(_, path)| path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify a hello v2 token issued by `backend_url`.
    pub fn verify_hello_v2(
        &self,
        token: &str,
        backend_url: &str,
    ) -> Result<HelloV2TokenClaims, Error> {
        let keys = self.keys.read().clone();
        if keys.is_empty() {
            return Err(Error::auth_failed("hello v2 is not enabled"));
        }

        let header = jsonwebtoken::decode_header(token)
            .map_err(|_| Error::auth_failed("invalid token"))?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[backend_url]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = TOKEN_LEEWAY_SECS as u64;

        let mut last_error = Error::auth_failed("no matching token key");
        for key in keys.iter().filter(|k| k.kind.matches(header.alg)) {
            match jsonwebtoken::decode::<HelloV2TokenClaims>(token, &key.decoding, &validation) {
                Ok(data) => {
                    let claims = data.claims;
                    if claims.sub.is_empty() {
                        return Err(Error::auth_failed("token subject missing"));
                    }
                    let now = chrono::Utc::now().timestamp();
                    if claims.iat > now + TOKEN_LEEWAY_SECS {
                        return Err(Error::token_not_valid_yet());
                    }
                    return Ok(claims);
                }
                Err(err) => {
                    use jsonwebtoken::errors::ErrorKind;
                    last_error = match err.kind() {
                        ErrorKind::ExpiredSignature => Error::token_expired(),
                        ErrorKind::ImmatureSignature => Error::token_not_valid_yet(),
                        ErrorKind::InvalidIssuer => Error::auth_failed("invalid token issuer"),
                        _ => {
                            tracing::debug!(key = %key.id, ?err, "token verification failed");
                            last_error
                        }
                    };
                }
            }
        }
        Err(last_error)
    }
}

/// Validate the HMAC handshake presented by an internal client: `token` must
/// be the hex HMAC-SHA256 of `random` with the shared internal secret.
pub fn validate_internal_auth(random: &str, token: &str, secret: &[u8]) -> bool {
    if random.len() < MIN_INTERNAL_RANDOM_LEN || secret.is_empty() {
        return false;
    }
    let Some(tag) = hex_decode(token) else {
        return false;
    };
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key");
    mac.update(random.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

/// Compute the hex token an internal client presents for `random`.
pub fn internal_auth_token(random: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key");
    mac.update(random.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub(crate) fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = hex_digit(chunk[0])?;
        let lo = hex_digit(chunk[1])?;
        out.push((hi << 4) | lo);
    }
    Some(out)
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Watch every configured key file and reload the snapshot on change.
pub fn watch_token_keys(
    store: Arc<TokenKeyStore>,
    watchers: &mut Vec<crate::watcher::FileWatcher>,
) {
    for path in store.watched_files() {
        let store = store.clone();
        match crate::watcher::FileWatcher::new(&path, move |_: &Path| {
            tracing::info!("token key changed, reloading");
            store.reload();
        }) {
            Ok(watcher) => watchers.push(watcher),
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "could not watch token key, hot reload disabled for this file");
            }
        }
    }
}
