//! Unified error types for the instancer workspace.
//!
//! Every fallible operation in the workspace returns [`InstancerError`].
//! The variants mirror the failure classes the lifecycle manager has to
//! tell apart: configuration, missing records, runtime rejections, and
//! the connection failures that drive reconnect-and-retry.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Why a connection to the container runtime could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionFailure {
    /// The runtime did not answer within the connect timeout.
    Timeout,
    /// The runtime (or the tunnel in front of it) rejected our credentials.
    Authentication,
    /// Any other transport-level failure.
    Transport,
    /// No endpoint is configured; the backend is disabled.
    NotConfigured,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Authentication => write!(f, "authentication"),
            Self::Transport => write!(f, "transport"),
            Self::NotConfigured => write!(f, "not configured"),
        }
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum InstancerError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The container runtime is unreachable or not configured.
    #[error("container runtime unavailable ({kind}): {message}")]
    Connection {
        /// Failure class.
        kind: ConnectionFailure,
        /// Human-readable detail.
        message: String,
    },

    /// A transport failure detected in the middle of a runtime call.
    #[error("runtime transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// The runtime refused an operation for a domain reason.
    #[error("{message}")]
    Runtime {
        /// Message reported by the runtime.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl InstancerError {
    /// Builds a [`InstancerError::Config`] from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The error returned whenever the runtime endpoint is disabled.
    #[must_use]
    pub fn not_configured() -> Self {
        Self::Connection {
            kind: ConnectionFailure::NotConfigured,
            message: "container runtime is not initialized, check settings".into(),
        }
    }

    /// Returns true for failures that a fresh connection may fix.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Connection {
                    kind: ConnectionFailure::Timeout | ConnectionFailure::Transport,
                    ..
                }
        )
    }

    /// Returns true if the error names a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// HTTP-equivalent status code for structured responses.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Config { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Connection { .. } => 503,
            Self::Transport { .. } | Self::Runtime { .. } => 502,
            Self::Io { .. } | Self::Serialization { .. } => 500,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, InstancerError>;
