//! Error types for the core library

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request or missing required field.
    #[error("{0}")]
    Validation(String),

    /// Ownership check failed (unlock/release without force).
    #[error("{0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    /// State conflict; carries the full response body so callers see the
    /// current state (claim holder, lock owner, handoff status).
    #[error("conflict")]
    Conflict(Value),

    /// No capacity available; carries the full response body.
    #[error("unavailable")]
    Unavailable(Value),

    /// Upstream returned a non-2xx; mirrored to the caller.
    #[error("Upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::MethodNotAllowed => 405,
            Self::Conflict(_) => 409,
            Self::Unavailable(_) => 503,
            Self::Upstream { status, .. } => {
                if (400..600).contains(status) {
                    *status
                } else {
                    502
                }
            }
            _ => 500,
        }
    }

    /// Response body for this error. Conflict and unavailable bodies pass
    /// through as-is so the current state reaches the caller.
    pub fn body(&self) -> Value {
        match self {
            Self::Conflict(body) | Self::Unavailable(body) => body.clone(),
            other => json!({ "error": other.to_string() }),
        }
    }
}
