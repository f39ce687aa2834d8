//! # Session Backend
//!
//! [`SessionBackend`] is the capability interface every execution backend
//! offers; callers depend only on it. [`ClusterBackend`] implements it on top
//! of a [`Cluster`].
//!
//! ## Run
//!
//! ```text
//! validate ──▶ artifact ──▶ claims ──▶ workload ──▶ wait ready ──▶ attach ──▶ register + watch
//!                 │            │           │             │            │
//!                 └────────────┴───────────┴─────────────┴────────────┴──▶ rollback (by session label)
//! ```
//!
//! Validation happens before anything exists, so an oversized payload never
//! reaches the cluster. Any later failure deletes every resource tagged with
//! the session id before the error is returned.
//!
//! ## Readiness
//!
//! | Observation | Outcome |
//! |-------------|---------|
//! | primary running or already terminated | ready |
//! | fatal waiting reason (`ErrImagePull`, ...) | [`Error::TerminalState`] |
//! | workload failed before the primary ran, or deleted | [`Error::TerminalState`] |
//! | nothing conclusive within `ready_timeout` | [`Error::NotReady`] |

use crate::cluster::{Cluster, ContainerState, Workload, WorkloadPhase};
use crate::config::BackendConfig;
use crate::constants::{
    FATAL_WAITING_REASONS, GRACEFUL_STOP_COMMAND, PRIMARY_CONTAINER, SESSION_ID_LABEL,
    SPEC_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::session::workload::{self, SessionResources};
use crate::session::{
    ExecResult, ExitResult, Handle, ListFilter, SessionId, SessionInfo, SessionRegistry,
    SessionSpec, SessionStatus, Watcher,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;

/// Session contract shared by every backend kind.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Short backend name.
    fn name(&self) -> &str;

    /// Starts a session and returns its handle once the workload is executing.
    async fn run(&self, spec: SessionSpec) -> Result<Arc<Handle>>;

    /// Returns the live handle, rebuilding one from the cluster if needed.
    async fn attach(&self, id: &SessionId) -> Result<Arc<Handle>>;

    /// Returns a snapshot of one session.
    async fn get(&self, id: &SessionId) -> Result<SessionInfo>;

    /// Lists managed sessions passing `filter`.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<SessionInfo>>;

    /// Requests graceful termination. Does not wait.
    async fn stop(&self, id: &SessionId) -> Result<()>;

    /// Removes the workload immediately.
    async fn kill(&self, id: &SessionId) -> Result<()>;

    /// Closes the handle and deletes every resource of the session. Idempotent.
    async fn destroy(&self, id: &SessionId) -> Result<()>;

    /// Runs a command inside the session's workload.
    async fn exec(&self, id: &SessionId, command: &[String]) -> Result<ExecResult>;

    /// Verifies the backend can reach its cluster.
    async fn health(&self) -> Result<()>;

    /// Closes every handle and clears the registry.
    async fn close(&self);
}

enum Readiness {
    Ready,
    Waiting,
    Terminal(String),
}

/// Session backend on a container-orchestration cluster.
pub struct ClusterBackend {
    cluster: Arc<dyn Cluster>,
    config: BackendConfig,
    registry: Arc<SessionRegistry>,
}

impl ClusterBackend {
    /// Creates a backend with an empty registry.
    pub fn new(cluster: Arc<dyn Cluster>, config: BackendConfig) -> Self {
        Self {
            cluster,
            config,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Backend configuration.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Registry of live handles.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    async fn provision(&self, resources: &SessionResources) -> Result<Workload> {
        if let Some(artifact) = &resources.artifact {
            self.cluster
                .create_artifact(self.namespace(), artifact)
                .await?;
        }
        for claim in &resources.claims {
            self.cluster
                .create_volume_claim(self.namespace(), claim)
                .await?;
        }
        self.cluster
            .create_workload(self.namespace(), &resources.workload)
            .await
    }

    async fn wait_ready(&self, id: &SessionId, name: &str) -> Result<Workload> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            let workload = self
                .cluster
                .get_workload(self.namespace(), name)
                .await?
                .ok_or_else(|| Error::TerminalState {
                    id: id.to_string(),
                    reason: "workload disappeared during startup".to_string(),
                })?;

            match readiness(&workload) {
                Readiness::Ready => return Ok(workload),
                Readiness::Terminal(reason) => {
                    return Err(Error::TerminalState {
                        id: id.to_string(),
                        reason,
                    });
                }
                Readiness::Waiting => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::NotReady {
                    id: id.to_string(),
                    waited: self.config.ready_timeout,
                });
            }
            tokio::time::sleep(self.config.ready_poll_interval.min(deadline - now)).await;
        }
    }

    async fn start(&self, id: &SessionId, spec: &SessionSpec) -> Result<Arc<Handle>> {
        let resources = workload::build(id, spec)?;
        self.provision(&resources).await?;
        let workload = self.wait_ready(id, &resources.workload.name).await?;

        let handle = Arc::new(Handle::new(
            id.clone(),
            self.namespace(),
            spec.clone(),
            self.cluster.clone(),
            &self.config,
        ));
        let output = self
            .cluster
            .attach_output(self.namespace(), &workload.name, PRIMARY_CONTAINER)
            .await?;
        handle.set_attach_streams(output);

        if spec.stdin {
            match self
                .cluster
                .attach_stdin(self.namespace(), &workload.name, PRIMARY_CONTAINER)
                .await
            {
                Ok(writer) => handle.attach_stdin(writer).await,
                Err(e) => {
                    tracing::warn!(session = %id, error = %e, "Stdin attach failed, input is discarded");
                }
            }
        }

        if matches!(workload.primary, Some(ContainerState::Running)) {
            handle.mark_running();
        }
        Ok(handle)
    }

    /// Deletes every resource tagged with the session id.
    ///
    /// All three deletions are attempted; the first failure is returned.
    async fn delete_resources(&self, id: &SessionId) -> Result<()> {
        let selector = workload::session_selector(id);
        let results = [
            self.cluster
                .delete_workloads(self.namespace(), &selector)
                .await,
            self.cluster
                .delete_artifacts(self.namespace(), &selector)
                .await,
            self.cluster
                .delete_volume_claims(self.namespace(), &selector)
                .await,
        ];
        results
            .into_iter()
            .filter(|r| !matches!(r, Err(e) if e.is_not_found()))
            .collect::<Result<Vec<()>>>()
            .map(|_| ())
    }

    async fn rollback(&self, id: &SessionId) {
        if let Err(e) = self.delete_resources(id).await {
            tracing::warn!(session = %id, error = %e, "Rollback incomplete");
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    async fn find_workload(&self, id: &SessionId) -> Result<Option<Workload>> {
        let workloads = self
            .cluster
            .list_workloads(self.namespace(), &workload::session_selector(id))
            .await?;
        Ok(workloads.into_iter().find(|w| !w.deleting))
    }

    /// Resolves the workload name and the live handle (if any) of a session.
    async fn locate(&self, id: &SessionId) -> Result<(String, Option<Arc<Handle>>)> {
        if let Some(handle) = self.registry.get(id) {
            return Ok((handle.workload_name().to_string(), Some(handle)));
        }
        let workload = self
            .find_workload(id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        Ok((workload.name, None))
    }

    fn reconstruct(&self, id: &SessionId, workload: &Workload) -> Handle {
        let spec = workload
            .annotations
            .get(SPEC_ANNOTATION)
            .and_then(|raw| match SessionSpec::from_annotation(raw) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    tracing::debug!(session = %id, error = %e, "Unreadable spec annotation");
                    None
                }
            })
            .unwrap_or_else(|| SessionSpec {
                image: workload.image.clone(),
                command: workload.command.clone(),
                labels: workload::user_labels(&workload.labels),
                ..Default::default()
            });
        Handle::new(
            id.clone(),
            self.namespace(),
            spec,
            self.cluster.clone(),
            &self.config,
        )
        .into_reconstructed(
            workload.name.clone(),
            workload.created_at.unwrap_or_else(Utc::now),
        )
    }

    fn not_found(id: &SessionId, err: Error) -> Error {
        if err.is_not_found() {
            Error::SessionNotFound(id.to_string())
        } else {
            err
        }
    }
}

fn readiness(workload: &Workload) -> Readiness {
    if workload.deleting {
        return Readiness::Terminal("workload is being deleted".to_string());
    }
    if matches!(
        workload.primary,
        Some(ContainerState::Running | ContainerState::Terminated { .. })
    ) {
        return Readiness::Ready;
    }
    if let Some(reason) = workload.waiting_reason() {
        if FATAL_WAITING_REASONS.contains(&reason) {
            return Readiness::Terminal(format!("primary container cannot start: {reason}"));
        }
    }
    if workload.phase.is_terminal() {
        return Readiness::Terminal(
            workload
                .message
                .clone()
                .unwrap_or_else(|| format!("workload {}", workload.phase)),
        );
    }
    Readiness::Waiting
}

/// Session snapshot derived from the cluster object alone.
fn info_from_workload(id: SessionId, namespace: &str, workload: &Workload) -> SessionInfo {
    let spec = workload
        .annotations
        .get(SPEC_ANNOTATION)
        .and_then(|raw| SessionSpec::from_annotation(raw).ok());
    let (status, exit_code, error) = match workload.phase {
        _ if workload.deleting => (SessionStatus::Stopping, None, None),
        WorkloadPhase::Succeeded => (
            SessionStatus::Stopped,
            Some(workload.exit_code().unwrap_or(0)),
            None,
        ),
        WorkloadPhase::Failed => {
            let result = match workload.exit_code() {
                Some(code) => ExitResult::exited(code),
                None => ExitResult::failure(
                    workload
                        .message
                        .clone()
                        .unwrap_or_else(|| "workload failed".to_string()),
                ),
            };
            (SessionStatus::Failed, Some(result.exit_code), result.error)
        }
        WorkloadPhase::Running if matches!(workload.primary, Some(ContainerState::Running)) => {
            (SessionStatus::Running, None, None)
        }
        _ => (SessionStatus::Pending, None, None),
    };

    SessionInfo {
        id,
        workload: workload.name.clone(),
        namespace: namespace.to_string(),
        image: spec
            .as_ref()
            .map_or_else(|| workload.image.clone(), |s| s.image.clone()),
        command: spec
            .as_ref()
            .map_or_else(|| workload.command.clone(), |s| s.command.clone()),
        labels: workload::user_labels(&workload.labels),
        status,
        exit_code,
        error,
        created_at: workload.created_at.unwrap_or_else(Utc::now),
        reconstructed: true,
    }
}

#[async_trait]
impl SessionBackend for ClusterBackend {
    fn name(&self) -> &str {
        self.cluster.name()
    }

    async fn run(&self, spec: SessionSpec) -> Result<Arc<Handle>> {
        spec.validate(self.config.max_file_bytes)?;
        let id = SessionId::generate();
        tracing::info!(session = %id, image = %spec.image, namespace = %self.namespace(), "Starting session");

        let handle = match self.start(&id, &spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "Session start failed, rolling back");
                self.rollback(&id).await;
                return Err(e);
            }
        };

        let handle = self.registry.register(handle);
        Watcher::spawn(self.cluster.clone(), handle.clone(), self.registry.clone());
        tracing::info!(session = %id, workload = %handle.workload_name(), "Session started");
        Ok(handle)
    }

    async fn attach(&self, id: &SessionId) -> Result<Arc<Handle>> {
        if let Some(handle) = self.registry.get(id) {
            return Ok(handle);
        }
        let workload = self
            .find_workload(id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        let handle = Arc::new(self.reconstruct(id, &workload));
        match self
            .cluster
            .attach_output(self.namespace(), &workload.name, PRIMARY_CONTAINER)
            .await
        {
            Ok(output) => handle.set_attach_streams(output),
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "Output attach failed, streams stay empty");
            }
        }
        if matches!(workload.primary, Some(ContainerState::Running)) {
            handle.mark_running();
        }

        let registered = self.registry.register(handle.clone());
        if Arc::ptr_eq(&registered, &handle) {
            Watcher::spawn(self.cluster.clone(), handle.clone(), self.registry.clone());
            tracing::info!(session = %id, workload = %workload.name, "Session re-attached");
        } else {
            handle.close().await;
        }
        Ok(registered)
    }

    async fn get(&self, id: &SessionId) -> Result<SessionInfo> {
        if let Some(handle) = self.registry.get(id) {
            return Ok(handle.info());
        }
        let workload = self
            .find_workload(id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        Ok(info_from_workload(id.clone(), self.namespace(), &workload))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<SessionInfo>> {
        let selector = workload::managed_selector().with_all(&filter.labels);
        let workloads = self
            .cluster
            .list_workloads(self.namespace(), &selector)
            .await?;

        let mut sessions: Vec<SessionInfo> = workloads
            .iter()
            .filter(|w| !w.deleting)
            .filter_map(|w| {
                let id = SessionId::from(w.labels.get(SESSION_ID_LABEL)?.as_str());
                Some(match self.registry.get(&id) {
                    Some(handle) => handle.info(),
                    None => info_from_workload(id, self.namespace(), w),
                })
            })
            .filter(|info| filter.matches(info))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn stop(&self, id: &SessionId) -> Result<()> {
        let (name, handle) = self.locate(id).await?;
        let command: Vec<String> = GRACEFUL_STOP_COMMAND.iter().map(|s| s.to_string()).collect();
        let output = self
            .cluster
            .exec(self.namespace(), &name, PRIMARY_CONTAINER, &command)
            .await
            .map_err(|e| Self::not_found(id, e))?;
        if output.exit_code != 0 {
            tracing::debug!(session = %id, exit_code = output.exit_code, "Stop command returned non-zero");
        }
        if let Some(handle) = handle {
            handle.mark_stopping();
        }
        tracing::info!(session = %id, "Stop requested");
        Ok(())
    }

    async fn kill(&self, id: &SessionId) -> Result<()> {
        let (name, handle) = self.locate(id).await?;
        self.cluster
            .delete_workload(self.namespace(), &name, Some(0))
            .await
            .map_err(|e| Self::not_found(id, e))?;
        if let Some(handle) = handle {
            handle.signal_exit(ExitResult::killed()).await;
        }
        tracing::info!(session = %id, "Session killed");
        Ok(())
    }

    async fn destroy(&self, id: &SessionId) -> Result<()> {
        let handle = self.registry.remove(id);
        match &handle {
            Some(handle) => handle.close().await,
            None => tracing::debug!(session = %id, "No live handle to close"),
        }
        let deleted = self.delete_resources(id).await;
        // The watcher is gone, so the outcome is delivered here.
        if let Some(handle) = handle {
            let result = match &deleted {
                Ok(()) => ExitResult::killed(),
                Err(e) => ExitResult::failure(format!("destroy failed: {e}")),
            };
            handle.signal_exit(result).await;
        }
        deleted?;
        tracing::info!(session = %id, "Session destroyed");
        Ok(())
    }

    async fn exec(&self, id: &SessionId, command: &[String]) -> Result<ExecResult> {
        if command.is_empty() {
            return Err(Error::InvalidInput("exec command cannot be empty".to_string()));
        }
        let (name, _) = self.locate(id).await?;
        let output = self
            .cluster
            .exec(self.namespace(), &name, PRIMARY_CONTAINER, command)
            .await
            .map_err(|e| Self::not_found(id, e))?;
        Ok(ExecResult {
            output: output.combined(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }

    async fn health(&self) -> Result<()> {
        self.cluster.health().await
    }

    async fn close(&self) {
        let handles = self.registry.drain();
        let count = handles.len();
        for handle in handles {
            handle.close().await;
            handle
                .signal_exit(ExitResult::failure("backend closed"))
                .await;
        }
        tracing::info!(sessions = count, "Backend closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn workload(phase: WorkloadPhase, primary: Option<ContainerState>) -> Workload {
        Workload {
            name: "mk-abc".into(),
            namespace: "default".into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            phase,
            primary,
            image: "alpine".into(),
            command: vec![],
            created_at: None,
            deleting: false,
            message: None,
        }
    }

    #[test]
    fn test_readiness_rules() {
        assert!(matches!(
            readiness(&workload(WorkloadPhase::Running, Some(ContainerState::Running))),
            Readiness::Ready
        ));
        assert!(matches!(
            readiness(&workload(
                WorkloadPhase::Succeeded,
                Some(ContainerState::Terminated {
                    exit_code: 0,
                    reason: "Completed".into()
                })
            )),
            Readiness::Ready
        ));
        assert!(matches!(
            readiness(&workload(
                WorkloadPhase::Pending,
                Some(ContainerState::Waiting {
                    reason: "ContainerCreating".into()
                })
            )),
            Readiness::Waiting
        ));
        assert!(matches!(
            readiness(&workload(
                WorkloadPhase::Pending,
                Some(ContainerState::Waiting {
                    reason: "ImagePullBackOff".into()
                })
            )),
            Readiness::Terminal(_)
        ));
        assert!(matches!(
            readiness(&workload(WorkloadPhase::Failed, None)),
            Readiness::Terminal(_)
        ));
    }

    #[test]
    fn test_info_from_failed_workload_without_code() {
        let mut w = workload(WorkloadPhase::Failed, None);
        w.message = Some("setup step 'setup-0' exited with code 3".into());
        let info = info_from_workload(SessionId::from("abc"), "default", &w);
        assert_eq!(info.status, SessionStatus::Failed);
        assert_eq!(info.exit_code, Some(-1));
        assert!(info.error.unwrap().contains("setup-0"));
        assert!(info.reconstructed);
    }
}
