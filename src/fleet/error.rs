//! Error types for the fleet core.
//!
//! Every fallible operation returns [`FleetError`]. Callers branch on the
//! variant (or on [`FleetError::kind`]) rather than on message text; the only
//! place where message text is inspected is [`classify_connect_error`], which
//! turns the free-form strings produced by the SSH transport and the
//! authentication chain into a typed variant.
//!
//! # Taxonomy
//!
//! | Kind | Variants | Caller behaviour |
//! |------|----------|------------------|
//! | Connectivity | `NotConnected`, `Authentication`, `Connection` | drives reconnect backoff |
//! | Command | `Command`, `Serialization` | recorded as a failed refresh |
//! | Validation | `Validation` | rejected before any remote call |
//! | NotFound | `NotFound`, `CacheUnavailable` | rendered as "not found", never retried |

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the registry, scheduler, bridge and transfer gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FleetError {
    /// No live session exists for the host.
    #[error("host {0} is not connected")]
    NotConnected(String),

    /// The server rejected every configured credential.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// TCP/SSH transport failure while establishing a session.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Remote command failed to run, timed out, or exited non-zero where that matters.
    #[error("command failed: {0}")]
    Command(String),

    /// Bad parameter supplied by the caller.
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// Unknown host or missing remote path.
    #[error("not found: {0}")]
    NotFound(String),

    /// No cached snapshot exists for the host and none could be produced.
    #[error("no cached telemetry for host {0}")]
    CacheUnavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Coarse error category used for user-visible rendering and scheduler decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    Command,
    Validation,
    NotFound,
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotConnected(_)
            | FleetError::Authentication(_)
            | FleetError::Connection(_) => ErrorKind::Connectivity,
            FleetError::Command(_) | FleetError::Serialization(_) => ErrorKind::Command,
            FleetError::Validation(_) => ErrorKind::Validation,
            FleetError::NotFound(_) | FleetError::CacheUnavailable(_) => ErrorKind::NotFound,
        }
    }

    /// True when the host has no live session.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, FleetError::NotConnected(_))
    }
}

impl Serialize for FleetError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

/// Authentication error patterns that indicate the credentials were rejected.
///
/// Matched case-insensitively against the message produced by the auth chain
/// or the transport.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "failed to load private key",
    "failed to decode private key",
];

/// Returns true when a transport/auth message describes rejected credentials.
pub(crate) fn is_authentication_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    AUTH_ERRORS
        .iter()
        .any(|pattern| error_lower.contains(pattern))
}

/// Map a connect-time failure message onto a typed variant.
pub(crate) fn classify_connect_error(error: impl Into<String>) -> FleetError {
    let error = error.into();
    if is_authentication_error(&error) {
        FleetError::Authentication(error)
    } else {
        FleetError::Connection(error)
    }
}
