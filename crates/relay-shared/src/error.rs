use thiserror::Error;

/// Reasons a decrypted payload cannot be interpreted.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing or invalid field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported payload version: {0}")]
    UnsupportedVersion(u64),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Unknown thread type: {0}")]
    UnknownThreadType(String),

    #[error("Call protocol level mismatch: expected {expected}, got {got}")]
    CallProtocolMismatch { expected: i64, got: i64 },

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
