//! Cluster-neutral descriptor and observation types.
//!
//! Descriptors describe what to create; observations ([`Workload`],
//! [`JobState`], [`ExecOutput`]) describe what the cluster reports back.
//! Implementations of [`super::Cluster`] translate between these and their
//! native objects.

use crate::error::Result;
use crate::files::ArtifactData;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncWrite};

// =============================================================================
// I/O Handles
// =============================================================================

/// Boxed raw byte source (attached output).
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed raw byte sink (attached stdin).
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bidirectional byte stream (one forwarded port connection).
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncDuplex for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed bidirectional byte stream.
pub type BoxedDuplex = Box<dyn AsyncDuplex>;

/// Stream of change events for one workload.
pub type WorkloadEventStream = BoxStream<'static, Result<WorkloadEvent>>;

/// Raw output sources of a workload's primary container.
///
/// Either source may be absent; an absent source behaves as an empty stream.
#[derive(Default)]
pub struct AttachedOutput {
    /// Standard output source.
    pub stdout: Option<BoxedReader>,
    /// Standard error source.
    pub stderr: Option<BoxedReader>,
}

impl std::fmt::Debug for AttachedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedOutput")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

// =============================================================================
// Label Selector
// =============================================================================

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    /// Creates an empty selector (matches everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `key=value` requirement.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Adds every pair of `labels` as requirements.
    #[must_use]
    pub fn with_all(mut self, labels: &BTreeMap<String, String>) -> Self {
        for (k, v) in labels {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    /// Returns true if `labels` satisfies every requirement.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Renders the selector in API query form (`k1=v1,k2=v2`).
    #[must_use]
    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_query())
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// A volume mount inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Volume name.
    pub volume: String,
    /// Mount path inside the container.
    pub mount_path: String,
    /// Single key of the volume to mount at `mount_path`.
    pub sub_path: Option<String>,
    /// Mount read-only.
    pub read_only: bool,
}

/// One container of a workload or job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Command (entrypoint override).
    pub command: Vec<String>,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Allocate a TTY.
    pub tty: bool,
    /// Keep stdin open.
    pub stdin: bool,
    /// CPU quantity (request = limit).
    pub cpu: Option<String>,
    /// Memory quantity (request = limit).
    pub memory: Option<String>,
    /// Declared container ports.
    pub ports: Vec<u16>,
    /// Volume mounts.
    pub mounts: Vec<MountDescriptor>,
}

/// Backing source of a workload volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    /// Empty scratch directory living as long as the workload.
    Scratch,
    /// Contents of a file-injection artifact.
    Artifact { name: String },
    /// A persistent volume claim.
    Claim { claim_name: String },
}

/// A named volume of a workload or job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    /// Volume name referenced by mounts.
    pub name: String,
    /// Backing source.
    pub source: VolumeSource,
}

/// A never-restarting workload with ordered init steps and one primary container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    /// Workload name.
    pub name: String,
    /// Labels (managed-by marker, session id, user labels).
    pub labels: BTreeMap<String, String>,
    /// Annotations (serialized session spec).
    pub annotations: BTreeMap<String, String>,
    /// Initialization steps, run in order before the primary container.
    pub init_steps: Vec<ContainerDescriptor>,
    /// Primary container.
    pub primary: ContainerDescriptor,
    /// Volumes.
    pub volumes: Vec<VolumeDescriptor>,
}

/// A file-injection artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Artifact name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Keyed text and binary entries.
    pub data: ArtifactData,
}

/// A persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaimDescriptor {
    /// Claim name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Requested storage quantity.
    pub size: String,
    /// Storage class (cluster default when absent).
    pub storage_class: Option<String>,
}

/// A run-to-completion job with ordered init steps and one step container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job name.
    pub name: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Initialization steps.
    pub init_steps: Vec<ContainerDescriptor>,
    /// Main step.
    pub step: ContainerDescriptor,
    /// Volumes.
    pub volumes: Vec<VolumeDescriptor>,
}

// =============================================================================
// Observations
// =============================================================================

/// Workload run phase as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkloadPhase {
    /// Accepted, not yet running.
    #[default]
    Pending,
    /// At least one container running.
    Running,
    /// All containers exited successfully.
    Succeeded,
    /// A container exited with failure or the workload errored.
    Failed,
    /// Phase could not be determined.
    Unknown,
}

impl WorkloadPhase {
    /// Parses the cluster's phase string.
    #[must_use]
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") | None => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            Some(_) => Self::Unknown,
        }
    }

    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// State of the primary container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    /// Not started yet.
    Waiting { reason: String },
    /// Executing.
    Running,
    /// Exited.
    Terminated { exit_code: i32, reason: String },
}

/// Observed workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    /// Workload name.
    pub name: String,
    /// Namespace.
    pub namespace: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    pub annotations: BTreeMap<String, String>,
    /// Run phase.
    pub phase: WorkloadPhase,
    /// Primary container state, when reported.
    pub primary: Option<ContainerState>,
    /// Primary container image.
    pub image: String,
    /// Primary container command.
    pub command: Vec<String>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
    /// Deletion has been requested.
    pub deleting: bool,
    /// Human-readable status message.
    pub message: Option<String>,
}

impl Workload {
    /// Exit code of the primary container, when it terminated.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match &self.primary {
            Some(ContainerState::Terminated { exit_code, .. }) => Some(*exit_code),
            _ => None,
        }
    }

    /// Waiting reason of the primary container, when waiting.
    #[must_use]
    pub fn waiting_reason(&self) -> Option<&str> {
        match &self.primary {
            Some(ContainerState::Waiting { reason }) => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Change event for a watched workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    /// The workload was created or modified.
    Applied(Workload),
    /// The workload was deleted.
    Deleted(Workload),
}

/// Job completion state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Still running (or not yet scheduled).
    Active,
    /// Completed successfully.
    Succeeded,
    /// Failed.
    Failed { message: String },
}

/// Result of an out-of-band command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Exit code, [`crate::constants::UNKNOWN_EXIT_CODE`] when unrecoverable.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Returns stdout followed by stderr.
    #[must_use]
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&self.stderr);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_query_is_sorted() {
        let selector = LabelSelector::new().with("b", "2").with("a", "1");
        assert_eq!(selector.to_query(), "a=1,b=2");
    }

    #[test]
    fn test_selector_matches_subset() {
        let labels: BTreeMap<String, String> = [("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(LabelSelector::new().with("a", "1").matches(&labels));
        assert!(!LabelSelector::new().with("a", "2").matches(&labels));
        assert!(LabelSelector::new().matches(&labels));
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!(WorkloadPhase::parse(None), WorkloadPhase::Pending);
        assert_eq!(WorkloadPhase::parse(Some("Succeeded")), WorkloadPhase::Succeeded);
        assert_eq!(WorkloadPhase::parse(Some("Weird")), WorkloadPhase::Unknown);
        assert!(WorkloadPhase::Failed.is_terminal());
        assert!(!WorkloadPhase::Running.is_terminal());
    }
}
