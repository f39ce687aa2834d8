//! Session state types.
//!
//! - `SessionId`: opaque unique identifier
//! - `SessionStatus`: lifecycle state with terminal ordering
//! - `ExitResult`: the single value delivered to waiters
//! - `SessionInfo`: read-only snapshot returned by `get`/`list`
//! - `ListFilter`, `ExecResult`: query and exec projections

use crate::constants::{KILLED_EXIT_CODE, UNKNOWN_EXIT_CODE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Session ID
// =============================================================================

/// Unique identifier for a session.
///
/// Generated once at creation (UUIDv4, hyphen-free so it is usable in
/// object names and label values) and stable for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Session Status
// =============================================================================

/// Session lifecycle state.
///
/// ```text
///   Pending ──▶ Running ──▶ Stopping ──▶ Stopped
///      │           │            │
///      └───────────┴────────────┴──▶ Failed | Killed
/// ```
///
/// Once terminal, no further transition is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Workload accepted, primary process not yet observed executing.
    #[default]
    Pending,
    /// Primary process observed executing.
    Running,
    /// Graceful termination requested, completion not yet observed.
    Stopping,
    /// Exited with code 0.
    Stopped,
    /// Exited non-zero or errored.
    Failed,
    /// Force-removed before natural completion.
    Killed,
}

impl SessionStatus {
    /// Returns true for `Stopped`, `Failed` and `Killed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Killed)
    }

    /// Parses the display form (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Killed => "killed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Exit Result
// =============================================================================

/// Terminal outcome of a session, delivered exactly once to waiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// Exit code of the primary process.
    pub exit_code: i32,
    /// Reported error, if the session ended abnormally.
    pub error: Option<String>,
    /// The workload was force-removed.
    pub killed: bool,
}

impl ExitResult {
    /// Natural exit with `exit_code`.
    #[must_use]
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            error: None,
            killed: false,
        }
    }

    /// Abnormal end with a diagnostic (exit code unknown).
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            exit_code: UNKNOWN_EXIT_CODE,
            error: Some(error.into()),
            killed: false,
        }
    }

    /// Forced removal.
    #[must_use]
    pub fn killed() -> Self {
        Self {
            exit_code: KILLED_EXIT_CODE,
            error: None,
            killed: true,
        }
    }

    /// Terminal status implied by this result.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        if self.killed {
            SessionStatus::Killed
        } else if self.exit_code == 0 && self.error.is_none() {
            SessionStatus::Stopped
        } else {
            SessionStatus::Failed
        }
    }
}

// =============================================================================
// Projections
// =============================================================================

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session id.
    pub id: SessionId,
    /// Workload name.
    pub workload: String,
    /// Namespace.
    pub namespace: String,
    /// Primary image.
    pub image: String,
    /// Primary command.
    pub command: Vec<String>,
    /// User labels.
    pub labels: BTreeMap<String, String>,
    /// Current status.
    pub status: SessionStatus,
    /// Exit code, once terminal.
    pub exit_code: Option<i32>,
    /// Exit error, once terminal.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// True when the snapshot was rebuilt from cluster metadata instead of a
    /// handle this process created. Injected file content is never recovered.
    pub reconstructed: bool,
}

/// Filter for [`crate::SessionBackend::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Keep only sessions in this status.
    pub status: Option<SessionStatus>,
    /// Keep only sessions carrying every one of these user labels.
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    /// Returns true if `info` passes the filter.
    #[must_use]
    pub fn matches(&self, info: &SessionInfo) -> bool {
        self.status.map_or(true, |status| status == info.status)
            && self
                .labels
                .iter()
                .all(|(k, v)| info.labels.get(k) == Some(v))
    }
}

/// Output of an out-of-band command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Stdout followed by stderr.
    pub output: Vec<u8>,
    /// Separated stdout.
    pub stdout: Vec<u8>,
    /// Separated stderr.
    pub stderr: Vec<u8>,
    /// Exit code, `-1` when not recoverable.
    pub exit_code: i32,
}
