//! Error types for the session backend and image builder.

use std::time::Duration;

/// Result type alias for session backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error category.
///
/// Callers branch on the kind to decide whether to retry, re-attach or give up.
/// Only [`ErrorKind::Timeout`] and [`ErrorKind::Transport`] are worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No matching session, workload or cluster resource.
    NotFound,
    /// A bounded wait (readiness, tunnel, build) elapsed.
    Timeout,
    /// The workload reached a terminal state before it became usable.
    TerminalState,
    /// The cluster API call itself failed.
    Transport,
    /// Input rejected before any resource was created.
    Validation,
    /// Local failure (I/O, serialization, invariant violation).
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not-found"),
            Self::Timeout => write!(f, "timeout"),
            Self::TerminalState => write!(f, "terminal-state"),
            Self::Transport => write!(f, "transport"),
            Self::Validation => write!(f, "validation"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Errors that can occur in the session backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Not Found
    // =========================================================================
    /// No session with this id exists in memory or on the cluster.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A cluster resource does not exist.
    #[error("{resource} not found: {name}")]
    NotFound { resource: String, name: String },

    // =========================================================================
    // Timeouts
    // =========================================================================
    /// The workload did not reach an executing state in time.
    #[error("session '{id}' not ready after {waited:?}")]
    NotReady { id: String, waited: Duration },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Terminal State
    // =========================================================================
    /// The workload terminated before it ever ran.
    #[error("session '{id}' terminated before running: {reason}")]
    TerminalState { id: String, reason: String },

    // =========================================================================
    // Transport
    // =========================================================================
    /// A cluster API call failed.
    #[error("cluster API call '{operation}' failed for {resource}: {reason}")]
    Api {
        operation: String,
        resource: String,
        reason: String,
    },

    /// Port tunnel could not be established.
    #[error("tunnel to port {port} failed: {reason}")]
    Tunnel { port: u16, reason: String },

    /// The build job failed.
    #[error("build of '{reference}' failed: {reason}{}", format_logs(.logs))]
    BuildFailed {
        reference: String,
        reason: String,
        logs: Option<String>,
    },

    // =========================================================================
    // Validation
    // =========================================================================
    /// A resource with this name already exists.
    #[error("{resource} already exists: {name}")]
    AlreadyExists { resource: String, name: String },

    /// Input rejected before any resource was created.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Injected file content exceeds the artifact size cap.
    #[error("injected files total {size} bytes, exceeding the limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    // =========================================================================
    // Internal
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_logs(logs: &Option<String>) -> String {
    match logs {
        Some(logs) if !logs.trim().is_empty() => {
            format!("\n--- build log ---\n{}", logs.trim_end())
        }
        _ => String::new(),
    }
}

impl Error {
    /// Returns the taxonomy category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) | Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotReady { .. } | Self::Timeout { .. } => ErrorKind::Timeout,
            Self::TerminalState { .. } | Self::BuildFailed { .. } => ErrorKind::TerminalState,
            Self::Api { .. } | Self::Tunnel { .. } => ErrorKind::Transport,
            Self::AlreadyExists { .. } | Self::InvalidInput(_) | Self::PayloadTooLarge { .. } => {
                ErrorKind::Validation
            }
            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true for not-found errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true for timeout errors.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Returns true when a caller-side retry may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Transport)
    }

    /// Builds a transport error with operation and resource context.
    pub(crate) fn api(
        operation: impl Into<String>,
        resource: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::Api {
            operation: operation.into(),
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Builds a not-found error for a cluster resource.
    pub(crate) fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
