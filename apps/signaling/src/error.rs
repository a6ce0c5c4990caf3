use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured error sent to clients as the payload of a `type: "error"`
/// server message. The `code` is stable API; the `message` text may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Error {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn invalid_hello_version() -> Self {
        Self::new("invalid_hello_version", "The hello version is not supported.")
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new("auth_failed", message)
    }

    pub fn token_expired() -> Self {
        Self::new("token_expired", "The token is expired.")
    }

    pub fn token_not_valid_yet() -> Self {
        Self::new("token_not_valid_yet", "The token is not valid yet.")
    }

    pub fn no_such_session() -> Self {
        Self::new("no_such_session", "The session to resume does not exist.")
    }

    pub fn already_joined() -> Self {
        Self::new("already_joined", "The session is already in this room.")
    }

    pub fn permission_denied() -> Self {
        Self::new("permission_denied", "Not allowed to perform this action.")
    }

    pub fn room_join_failed(message: impl Into<String>) -> Self {
        Self::new("room_join_failed", message)
    }

    pub fn session_limit_exceeded() -> Self {
        Self::new(
            "session_limit_exceeded",
            "Too many sessions connected for this backend.",
        )
    }

    pub fn client_not_found() -> Self {
        Self::new("client_not_found", "The target client could not be found.")
    }

    pub fn hello_expected() -> Self {
        Self::new("hello_expected", "Expected a hello message.")
    }

    pub fn message_too_long(limit: usize) -> Self {
        Self::new(
            "message_too_long",
            format!("The message exceeds the maximum length of {limit} bytes."),
        )
    }

    pub fn invalid_format() -> Self {
        Self::new("invalid_format", "The message could not be parsed.")
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::new("invalid_message", message)
    }

    pub fn server_error() -> Self {
        Self::new("server_error", "An internal error occurred.")
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_without_empty_details() {
        let err = Error::hello_expected();
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "hello_expected");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn serializes_details_when_present() {
        let err = Error::with_details(
            "room_join_failed",
            "denied",
            serde_json::json!({"roomid": "r1"}),
        );
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["details"]["roomid"], "r1");
    }
}
