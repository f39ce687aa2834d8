//! # Cluster Interface
//!
//! The `Cluster` trait is the only seam between session semantics and the
//! container-orchestration API. Everything above it (handles, watchers, the
//! backend, the builder) is written against neutral descriptors; everything
//! below it translates those descriptors into native objects.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ClusterBackend / ImageBuilder / Handle / Watcher            │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ WorkloadDescriptor, JobDescriptor, ...
//!                  ┌─────────────┴─────────────┐
//!                  ▼                           ▼
//!          ┌───────────────┐           ┌───────────────┐
//!          │  KubeCluster  │           │ MemoryCluster │
//!          │  (kube-rs)    │           │ (in-process)  │
//!          └───────────────┘           └───────────────┘
//! ```
//!
//! ## Selector Convention
//!
//! Per-session resources are located exclusively through labels. Bulk
//! deletion always takes a [`LabelSelector`]; a selector matching nothing is
//! not an error.
//!
//! ## Error Contract
//!
//! - Missing resources surface as [`Error::NotFound`](crate::Error::NotFound).
//! - Name collisions surface as [`Error::AlreadyExists`](crate::Error::AlreadyExists).
//! - Every other API failure surfaces as [`Error::Api`](crate::Error::Api)
//!   carrying operation and resource name.

mod kubernetes;
mod memory;
mod types;

pub use kubernetes::KubeCluster;
pub use memory::MemoryCluster;
pub use types::{
    ArtifactDescriptor, AsyncDuplex, AttachedOutput, BoxedDuplex, BoxedReader, BoxedWriter,
    ContainerDescriptor, ContainerState, ExecOutput, JobDescriptor, JobState, LabelSelector,
    MountDescriptor, VolumeClaimDescriptor, VolumeDescriptor, VolumeSource, Workload,
    WorkloadDescriptor, WorkloadEvent, WorkloadEventStream, WorkloadPhase,
};

use crate::error::Result;
use async_trait::async_trait;

/// Container-orchestration operations used by the session backend and builder.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared by the
/// backend, every handle, every watcher and the builder.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Short implementation name for logs.
    fn name(&self) -> &str;

    // =========================================================================
    // Artifacts and Claims
    // =========================================================================

    /// Creates a file-injection artifact.
    async fn create_artifact(&self, namespace: &str, artifact: &ArtifactDescriptor) -> Result<()>;

    /// Deletes every artifact matching `selector`.
    async fn delete_artifacts(&self, namespace: &str, selector: &LabelSelector) -> Result<()>;

    /// Creates a persistent volume claim.
    async fn create_volume_claim(
        &self,
        namespace: &str,
        claim: &VolumeClaimDescriptor,
    ) -> Result<()>;

    /// Deletes every volume claim matching `selector`.
    async fn delete_volume_claims(&self, namespace: &str, selector: &LabelSelector) -> Result<()>;

    // =========================================================================
    // Workloads
    // =========================================================================

    /// Submits a workload.
    async fn create_workload(
        &self,
        namespace: &str,
        workload: &WorkloadDescriptor,
    ) -> Result<Workload>;

    /// Returns the workload, or `None` if it does not exist.
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>>;

    /// Lists workloads matching `selector`.
    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Workload>>;

    /// Deletes one workload. `grace_period_secs = Some(0)` removes it immediately.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`](crate::Error::NotFound) if the workload does not exist.
    async fn delete_workload(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<()>;

    /// Deletes every workload matching `selector` immediately.
    async fn delete_workloads(&self, namespace: &str, selector: &LabelSelector) -> Result<()>;

    /// Subscribes to change events of one workload.
    ///
    /// The stream starts with the current state and ends after a
    /// [`WorkloadEvent::Deleted`] event. Returns [`crate::Error::NotFound`]
    /// if the workload does not exist at subscription time.
    async fn watch_workload(&self, namespace: &str, name: &str) -> Result<WorkloadEventStream>;

    // =========================================================================
    // Day-2 Operations
    // =========================================================================

    /// Runs a command inside a container and captures its output.
    ///
    /// A missing exit status is reported as
    /// [`UNKNOWN_EXIT_CODE`](crate::constants::UNKNOWN_EXIT_CODE), not as an error.
    async fn exec(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;

    /// Opens the raw output sources of a container.
    async fn attach_output(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<AttachedOutput>;

    /// Opens the stdin sink of a container.
    async fn attach_stdin(&self, namespace: &str, name: &str, container: &str)
    -> Result<BoxedWriter>;

    /// Returns the log of a container (last `tail_lines` lines when given).
    async fn logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String>;

    /// Opens one forwarded connection to `port` inside the workload.
    async fn port_forward(&self, namespace: &str, name: &str, port: u16) -> Result<BoxedDuplex>;

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Submits a run-to-completion job.
    async fn create_job(&self, namespace: &str, job: &JobDescriptor) -> Result<()>;

    /// Returns the job's completion state.
    async fn job_state(&self, namespace: &str, name: &str) -> Result<JobState>;

    /// Returns the last `tail_lines` log lines of `container` in the job's pod.
    async fn job_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        tail_lines: i64,
    ) -> Result<String>;

    /// Deletes a job together with its pods.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    // =========================================================================
    // Health
    // =========================================================================

    /// Verifies the cluster API is reachable.
    async fn health(&self) -> Result<()>;
}
