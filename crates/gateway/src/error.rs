//! Error types for the gateway.

use thiserror::Error;

/// Main error type for gateway startup and configuration.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors (invalid YAML, missing fields, bad URLs)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy set failed to compile (fatal at startup)
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Claims could not be resolved for a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("bearer token is required")]
    MissingToken,

    #[error("invalid bearer token: {0}")]
    InvalidToken(String),

    #[error("token is missing a subject claim")]
    MissingSubject,

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// RFC 6750 `error` attribute for the `WWW-Authenticate` challenge.
    #[must_use]
    pub fn challenge_error(&self) -> Option<&'static str> {
        match self {
            Self::MissingToken => None,
            Self::InvalidToken(_) | Self::MissingSubject => Some("invalid_token"),
            Self::Unavailable(_) => Some("temporarily_unavailable"),
        }
    }
}

/// Policy compilation or evaluation failures.
#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("policy compile error: {0}")]
    Compile(String),

    #[error("entity data error: {0}")]
    Entities(String),

    #[error("malformed entity: {0}")]
    Entity(String),
}

/// Backend (upstream) failures. Surfaced to callers as opaque 5xx responses.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream timed out after {0}ms")]
    Timeout(u128),

    #[error("upstream response exceeds {0} bytes")]
    TooLarge(usize),

    #[error("upstream list response has content-encoding {0:?} and cannot be filtered")]
    Encoded(String),
}

/// Audit sink failures. Logged locally, never surfaced to the caller.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit sink is full; event dropped")]
    SinkFull,

    #[error("audit sink is closed")]
    SinkClosed,

    #[error("audit event encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}
