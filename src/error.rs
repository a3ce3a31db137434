//! Error types for identity-mesh
//!
//! Internal failures carry enough context for operators. Anything that
//! crosses the wire is reduced to a [`Status`] with a stable [`StatusCode`]
//! and a short message that never contains key material.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for identity-mesh
pub type Result<T> = std::result::Result<T, Error>;

/// identity-mesh errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value failed validation
    #[error("Invalid {field}: {message}")]
    Validation {
        /// Field or parameter that failed
        field: &'static str,
        /// Human-readable reason
        message: String,
    },

    /// No usable certificate (fetch failed, expired, malformed)
    #[error("Certificate unavailable: {0}")]
    CertificateUnavailable(String),

    /// No usable trust bundle for the requested trust domain
    #[error("Trust bundle unavailable: {0}")]
    TrustBundleUnavailable(String),

    /// The identity source or remote peer could not be reached, or the
    /// component was already closed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Caller identity could not be established
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Caller identity was established but is not allowed
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Transport error (handshake, framing)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Health check failure
    #[error("Health check error: {0}")]
    HealthCheck(String),

    /// Start was requested on a component that is already running
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// A remote peer rejected the call
    #[error("Remote rejected call ({}): {}", .0.code, .0.message)]
    Remote(Status),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error for `field`
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Map to the stable status code surfaced to remote callers
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::Unauthenticated,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::CertificateUnavailable(_)
            | Self::TrustBundleUnavailable(_)
            | Self::ConnectionFailed(_)
            | Self::Transport(_)
            | Self::Io(_)
            | Self::Http(_) => StatusCode::Unavailable,
            Self::Validation { .. } | Self::Config(_) | Self::Json(_) => {
                StatusCode::InvalidArgument
            }
            Self::Remote(status) => status.code,
            _ => StatusCode::Internal,
        }
    }

    /// Reduce to a wire-safe [`Status`]
    #[must_use]
    pub fn to_status(&self) -> Status {
        match self {
            Self::Remote(status) => status.clone(),
            Self::Unauthenticated(msg) | Self::PermissionDenied(msg) => {
                Status::new(self.status_code(), msg.clone())
            }
            Self::Validation { field, .. } => {
                Status::new(StatusCode::InvalidArgument, format!("invalid {field}"))
            }
            _ => Status::new(self.status_code(), self.status_code().default_message()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire status
// ─────────────────────────────────────────────────────────────────────────────

/// Stable status codes carried on rejected calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Call completed
    Ok,
    /// Caller identity could not be established
    Unauthenticated,
    /// Caller is not authorized
    PermissionDenied,
    /// Dependency or peer unavailable
    Unavailable,
    /// Malformed request
    InvalidArgument,
    /// Unexpected failure
    Internal,
}

impl StatusCode {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied => "permission_denied",
            Self::Unavailable => "unavailable",
            Self::InvalidArgument => "invalid_argument",
            Self::Internal => "internal",
        }
    }

    const fn default_message(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Unauthenticated => "authentication required",
            Self::PermissionDenied => "permission denied",
            Self::Unavailable => "service unavailable",
            Self::InvalidArgument => "invalid request",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected call: stable code plus a short, non-sensitive message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Status code
    pub code: StatusCode,
    /// Message safe to show the caller
    pub message: String,
}

impl Status {
    /// Create a status
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `Unauthenticated` status
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }

    /// `PermissionDenied` status
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PermissionDenied, message)
    }

    /// `InvalidArgument` status
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    /// `Internal` status
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Self::Remote(status)
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        err.to_status()
    }
}
