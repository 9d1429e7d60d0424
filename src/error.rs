//! Unified error handling for railguard operations.
//!
//! Input-quality conditions (rejected fixes, off-track positions) are not
//! errors: they are modeled as `Option`/outcome variants in the pipeline and
//! recovered in place. This type covers the failures that must surface to the
//! caller: missing permissions, missing authority, storage, transport, and
//! configuration problems.

use thiserror::Error;

/// Unified error type for railguard operations.
#[derive(Debug, Error)]
pub enum RailguardError {
    /// Location or background access was denied by the platform.
    /// Fatal to starting a tracking session.
    #[error("location permission denied: {0}")]
    PermissionDenied(String),

    /// Tracking was started without an Active authority.
    #[error("no active authority: {0}")]
    NoActiveAuthority(String),

    /// Local storage failure.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Remote service failure (transport or non-2xx status).
    #[error("http error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Http {
        message: String,
        status: Option<u16>,
    },

    /// A persisted or remote record could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for RailguardError {
    fn from(e: reqwest::Error) -> Self {
        RailguardError::Http {
            message: e.to_string(),
            status: e.status().map(|s| s.as_u16()),
        }
    }
}

impl From<serde_json::Error> for RailguardError {
    fn from(e: serde_json::Error) -> Self {
        RailguardError::Parse(e.to_string())
    }
}

/// Result type alias for railguard operations.
pub type Result<T> = std::result::Result<T, RailguardError>;
