//! Codec for the public session ids handed out to clients.
//!
//! A public id binds the internal session id to the backend that
//! authenticated it, authenticated with an HMAC tag so only the issuing hub
//! can decode it. The encoded form is URL- and JSON-safe.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::session::SessionId;

type HmacSha256 = Hmac<Sha256>;

/// Length of the truncated HMAC tag appended to the payload.
const TAG_LEN: usize = 16;

/// The data carried inside a public session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdData {
    #[serde(rename = "b")]
    pub backend_url: String,
    #[serde(rename = "s")]
    pub session_id: SessionId,
}

/// Encoder/decoder for public session ids, keyed with the hub's secret.
pub struct PublicIdCodec {
    key: Vec<u8>,
}

impl PublicIdCodec {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: secret.to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.key).expect("hmac key")
    }

    /// Encode a session id into its public form.
    pub fn encode(&self, data: &SessionIdData) -> String {
        let payload = serde_json::to_vec(data).expect("session id data serializes");
        let mut mac = self.mac();
        mac.update(&payload);
        let tag = mac.finalize().into_bytes();

        let mut buf = payload;
        buf.extend_from_slice(&tag[..TAG_LEN]);
        URL_SAFE_NO_PAD.encode(&buf)
    }

    /// Decode a public session id. Returns `None` for anything that was not
    /// produced by `encode` with the same key.
    pub fn decode(&self, public_id: &str) -> Option<SessionIdData> {
        let buf = URL_SAFE_NO_PAD.decode(public_id).ok()?;
        if buf.len() <= TAG_LEN {
            return None;
        }
        let (payload, tag) = buf.split_at(buf.len() - TAG_LEN);

        let mut mac = self.mac();
        mac.update(payload);
        mac.verify_truncated_left(tag).ok()?;

        serde_json::from_slice(payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PublicIdCodec {
        PublicIdCodec::new(b"the-session-secret")
    }

    #[test]
    fn roundtrip() {
        let codec = codec();
        let data = SessionIdData {
            backend_url: "https://backend.example/ocs".to_string(),
            session_id: 42,
        };
        let public = codec.encode(&data);
        assert_eq!(codec.decode(&public), Some(data));
    }

    #[test]
    fn encode_is_deterministic_per_session() {
        let codec = codec();
        let data = SessionIdData {
            backend_url: "https://backend.example".to_string(),
            session_id: 7,
        };
        assert_eq!(codec.encode(&data), codec.encode(&data));
    }

    #[test]
    fn different_sessions_never_collide() {
        let codec = codec();
        let a = codec.encode(&SessionIdData {
            backend_url: "https://backend.example".to_string(),
            session_id: 1,
        });
        let b = codec.encode(&SessionIdData {
            backend_url: "https://backend.example".to_string(),
            session_id: 2,
        });
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_input_decodes_to_none() {
        let codec = codec();
        assert_eq!(codec.decode(""), None);
        assert_eq!(codec.decode("not-base64!@#"), None);
        assert_eq!(codec.decode("aGVsbG8"), None);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let codec = codec();
        let public = codec.encode(&SessionIdData {
            backend_url: "https://backend.example".to_string(),
            session_id: 42,
        });
        let mut buf = URL_SAFE_NO_PAD.decode(&public).unwrap();
        buf[0] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(&buf);
        assert_eq!(codec.decode(&tampered), None);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let public = codec().encode(&SessionIdData {
            backend_url: "https://backend.example".to_string(),
            session_id: 42,
        });
        let other = PublicIdCodec::new(b"another-secret");
        assert_eq!(other.decode(&public), None);
    }
}
