//! Error types for the port knocking protocol.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionId;

/// Protocol-level errors, recovered at the request boundary and reported as text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Required query parameter is absent
    #[error("no parameter '{0}'")]
    MissingParameter(&'static str),
    /// Port list is empty, not numeric or out of range
    #[error("failed to parse ports '{0}'")]
    MalformedPorts(String),
    /// Process id is not a positive integer in range
    #[error("failed to parse pid '{0}'")]
    MalformedPid(String),
    /// No pending session recognizes any of the tuples
    #[error("no session found")]
    NoSession,
    /// Tuples resolve to more than one pending session
    #[error("tuples match {count} sessions")]
    AmbiguousSession {
        /// Number of distinct sessions matched
        count: usize,
    },
    /// Session was removed concurrently or never existed
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    /// Fewer tuples were unindexed than the session owned
    #[error("session {session}: removed {removed} of {expected} tuples")]
    IntegrityMismatch {
        /// Session that was removed
        session: SessionId,
        /// Tuples owned by the session
        expected: usize,
        /// Tuples actually found in the key index
        removed: usize,
    },
}

/// Errors raised by the server, service and client processes.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
    /// Socket or filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding failure
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Too few knock ports could be bound to serve the range
    #[error("bound only {bound} of {total} ports")]
    Bind {
        /// Ports bound successfully
        bound: usize,
        /// Ports requested
        total: usize,
    },
    /// Malformed HTTP exchange or non-200 status
    #[error("HTTP error: {0}")]
    Http(String),
    /// The marker file was not removed before the confirmation timeout
    #[error("knock not confirmed, marker {0:?} still present")]
    Unconfirmed(PathBuf),
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Serialization(e.to_string())
    }
}
