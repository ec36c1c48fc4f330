use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// JSON-RPC error codes the target daemon uses for "object does not exist".
const ENOENT: i64 = -2;
const ENODEV: i64 = -19;

/// Message fragments that mark a structured error as "already absent".
const NOT_FOUND_PATTERNS: &[&str] = &["does not exist", "not found", "Unable to find", "No such"];

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("daemon unavailable at {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("connection to daemon lost during {method}: {source}")]
    Closed {
        method: String,
        #[source]
        source: io::Error,
    },

    #[error("{method} failed: {message} (code {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },

    #[error("{method}: object not found: {message} (code {code})")]
    NotFound {
        method: String,
        code: i64,
        message: String,
    },

    #[error("unexpected response to {method}: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RpcError {
    /// Build the error for a structured daemon error response, classifying
    /// "already absent" answers as [`RpcError::NotFound`].
    pub fn from_daemon(method: &str, code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        let method = method.to_string();
        let absent = code == ENOENT
            || code == ENODEV
            || NOT_FOUND_PATTERNS.iter().any(|p| message.contains(p));
        if absent {
            RpcError::NotFound {
                method,
                code,
                message,
            }
        } else {
            RpcError::Protocol {
                method,
                code,
                message,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::NotFound { .. })
    }

    /// True when the daemon could not be reached or dropped the connection.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RpcError::Unavailable { .. } | RpcError::Closed { .. })
    }

    /// The RPC method the error relates to, if one was in flight.
    pub fn method(&self) -> Option<&str> {
        match self {
            RpcError::Unavailable { .. } => None,
            RpcError::Closed { method, .. }
            | RpcError::Protocol { method, .. }
            | RpcError::NotFound { method, .. }
            | RpcError::Decode { method, .. } => Some(method),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
