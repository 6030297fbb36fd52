//! Error types for the session log, tool dispatch, the narrator client and
//! configuration.

use game_rules::DiceError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::session_log::SessionId;

/// Errors raised by Session Log operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A structural operation would break a Session invariant.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no session record for {0}")]
    NotFound(SessionId),

    #[error("session record {session_id} is corrupt: {reason}")]
    Corruption { session_id: SessionId, reason: String },

    /// The durable write did not complete; in-memory state was left untouched.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        SessionError::Validation(message.into())
    }

    /// Whether this error ends the current turn rather than being reported
    /// back to the narrator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Persistence(_))
    }
}

/// Errors raised by a [`SessionStore`](crate::session_log::SessionStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),

    /// The record exists but is not a parseable session document.
    #[error("unparseable record: {0}")]
    Unparseable(String),

    /// Writes were disabled (used by the in-memory store to simulate failures).
    #[error("store is rejecting writes")]
    WriteRejected,
}

/// Structured tool failures. These are reported back to the narrator as tool
/// results and never end the turn on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    Argument { tool: String, message: String },

    #[error("{tool} failed: {message}")]
    Execution { tool: String, message: String },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
}

/// Failure raised inside a tool handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Dice(#[from] DiceError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors talking to the narrator model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// Transport or service failure; retried with backoff.
    #[error("narrator communication failed: {0}")]
    Communication(String),

    #[error("narrator did not answer within {0:?}")]
    Timeout(Duration),

    /// The service answered with something that is not a usable reply.
    #[error("narrator protocol error: {0}")]
    Protocol(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Communication(_) | ModelError::Timeout(_))
    }
}

/// Errors loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
