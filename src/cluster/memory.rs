//! In-process implementation of [`Cluster`].
//!
//! `MemoryCluster` keeps every object in memory and lets the caller script
//! what the "cluster" does: start workloads, write their output, terminate
//! them with an exit code, fail their startup, and decide how jobs end. It
//! honours the same error contract as [`super::KubeCluster`], so the backend,
//! watcher and builder run unchanged against it.
//!
//! ## Example
//!
//! ```rust,ignore
//! let cluster = Arc::new(MemoryCluster::new());
//! let backend = ClusterBackend::new(cluster.clone(), BackendConfig::default());
//! let handle = backend.run(spec).await?;
//!
//! cluster.write_stdout(handle.workload_name(), b"hi\n").await?;
//! cluster.complete(handle.workload_name(), 0).await?;
//! ```

use super::types::{
    ArtifactDescriptor, AttachedOutput, BoxedDuplex, BoxedWriter, ContainerState, ExecOutput,
    JobDescriptor, JobState, LabelSelector, VolumeClaimDescriptor, Workload, WorkloadDescriptor,
    WorkloadEvent, WorkloadEventStream, WorkloadPhase,
};
use super::Cluster;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::debug;

/// Capacity of each simulated output pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Capacity of the workload event channel.
const EVENT_CAPACITY: usize = 256;

/// Answers exec requests: `(workload, command) -> output`.
pub type ExecResponder = Arc<dyn Fn(&str, &[String]) -> ExecOutput + Send + Sync>;

type SharedWriter = Arc<AsyncMutex<Option<DuplexStream>>>;

struct OutputPipe {
    writer: SharedWriter,
    reader: Option<DuplexStream>,
}

impl OutputPipe {
    fn new() -> Self {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        Self {
            writer: Arc::new(AsyncMutex::new(Some(writer))),
            reader: Some(reader),
        }
    }
}

struct WorkloadRecord {
    workload: Workload,
    descriptor: WorkloadDescriptor,
    stdout: OutputPipe,
    stderr: OutputPipe,
    stdin: Arc<Mutex<Vec<u8>>>,
    log: Vec<u8>,
}

struct JobRecord {
    polls: u32,
}

struct State {
    workloads: BTreeMap<String, WorkloadRecord>,
    artifacts: BTreeMap<String, ArtifactDescriptor>,
    claims: BTreeMap<String, VolumeClaimDescriptor>,
    jobs: BTreeMap<String, JobRecord>,
    job_history: Vec<JobDescriptor>,
    exec_log: Vec<(String, Vec<String>)>,
    workloads_created: usize,
    job_outcome: JobState,
    job_logs: String,
    exec_responder: ExecResponder,
    port_forward_delay: Duration,
}

impl Default for State {
    fn default() -> Self {
        Self {
            workloads: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            claims: BTreeMap::new(),
            jobs: BTreeMap::new(),
            job_history: Vec::new(),
            exec_log: Vec::new(),
            workloads_created: 0,
            job_outcome: JobState::Succeeded,
            job_logs: String::new(),
            exec_responder: Arc::new(|_, _| ExecOutput::default()),
            port_forward_delay: Duration::ZERO,
        }
    }
}

/// Scriptable in-memory cluster.
pub struct MemoryCluster {
    state: Mutex<State>,
    events: broadcast::Sender<(String, WorkloadEvent)>,
    auto_start: AtomicBool,
    fail_watches: AtomicBool,
    fail_workload_creates: AtomicBool,
    healthy: AtomicBool,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// Creates an empty cluster whose workloads start running immediately.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
            auto_start: AtomicBool::new(true),
            fail_watches: AtomicBool::new(false),
            fail_workload_creates: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    /// Controls whether new workloads start `Running` or stay `Pending`.
    #[must_use]
    pub fn with_auto_start(self, auto_start: bool) -> Self {
        self.auto_start.store(auto_start, Ordering::SeqCst);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to a workload and publishes the change.
    fn update(&self, name: &str, f: impl FnOnce(&mut Workload)) -> Result<()> {
        let mut state = self.lock();
        let record = state
            .workloads
            .get_mut(name)
            .ok_or_else(|| Error::not_found("workload", name))?;
        f(&mut record.workload);
        let _ = self
            .events
            .send((name.to_string(), WorkloadEvent::Applied(record.workload.clone())));
        Ok(())
    }

    /// Removes a workload and publishes its deletion.
    fn remove(&self, state: &mut State, name: &str) -> Option<Workload> {
        let mut record = state.workloads.remove(name)?;
        record.workload.deleting = true;
        let _ = self
            .events
            .send((name.to_string(), WorkloadEvent::Deleted(record.workload.clone())));
        Some(record.workload)
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Moves a pending workload to `Running`.
    pub fn start(&self, name: &str) -> Result<()> {
        self.update(name, |w| {
            w.phase = WorkloadPhase::Running;
            w.primary = Some(ContainerState::Running);
        })
    }

    /// Leaves the primary container waiting with `reason` (e.g. `ErrImagePull`).
    pub fn fail_start(&self, name: &str, reason: &str) -> Result<()> {
        self.update(name, |w| {
            w.phase = WorkloadPhase::Pending;
            w.primary = Some(ContainerState::Waiting {
                reason: reason.to_string(),
            });
        })
    }

    /// Fails the workload before the primary container runs (a setup step failed).
    pub fn fail_setup(&self, name: &str, message: &str) -> Result<()> {
        self.update(name, |w| {
            w.phase = WorkloadPhase::Failed;
            w.primary = Some(ContainerState::Waiting {
                reason: "PodInitializing".to_string(),
            });
            w.message = Some(message.to_string());
        })
    }

    /// Appends bytes to the primary container's stdout.
    pub async fn write_stdout(&self, name: &str, data: &[u8]) -> Result<()> {
        self.write_output(name, data, false).await
    }

    /// Appends bytes to the primary container's stderr.
    pub async fn write_stderr(&self, name: &str, data: &[u8]) -> Result<()> {
        self.write_output(name, data, true).await
    }

    async fn write_output(&self, name: &str, data: &[u8], stderr: bool) -> Result<()> {
        let writer = {
            let mut state = self.lock();
            let record = state
                .workloads
                .get_mut(name)
                .ok_or_else(|| Error::not_found("workload", name))?;
            record.log.extend_from_slice(data);
            if stderr {
                record.stderr.writer.clone()
            } else {
                record.stdout.writer.clone()
            }
        };
        let mut guard = writer.lock().await;
        let pipe = guard.as_mut().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "workload output closed",
            ))
        })?;
        pipe.write_all(data).await?;
        Ok(())
    }

    /// Terminates the primary container with `exit_code`.
    ///
    /// Output pipes are closed before the terminal state is published.
    pub async fn complete(&self, name: &str, exit_code: i32) -> Result<()> {
        let writers = {
            let state = self.lock();
            let record = state
                .workloads
                .get(name)
                .ok_or_else(|| Error::not_found("workload", name))?;
            [record.stdout.writer.clone(), record.stderr.writer.clone()]
        };
        for writer in writers {
            if let Some(mut pipe) = writer.lock().await.take() {
                let _ = pipe.shutdown().await;
            }
        }
        self.update(name, |w| {
            w.phase = if exit_code == 0 {
                WorkloadPhase::Succeeded
            } else {
                WorkloadPhase::Failed
            };
            w.primary = Some(ContainerState::Terminated {
                exit_code,
                reason: if exit_code == 0 { "Completed" } else { "Error" }.to_string(),
            });
        })
    }

    /// Makes every subsequent watch subscription fail.
    pub fn set_fail_watches(&self, fail: bool) {
        self.fail_watches.store(fail, Ordering::SeqCst);
    }

    /// Delays every subsequent port-forward by `delay` before it connects.
    pub fn set_port_forward_delay(&self, delay: Duration) {
        self.lock().port_forward_delay = delay;
    }

    /// Makes every subsequent workload creation fail.
    pub fn set_fail_workload_creates(&self, fail: bool) {
        self.fail_workload_creates.store(fail, Ordering::SeqCst);
    }

    /// Controls the health probe result.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Replaces the exec responder.
    pub fn set_exec_responder(
        &self,
        responder: impl Fn(&str, &[String]) -> ExecOutput + Send + Sync + 'static,
    ) {
        self.lock().exec_responder = Arc::new(responder);
    }

    /// Sets how newly polled jobs end (after one `Active` poll).
    pub fn set_job_outcome(&self, outcome: JobState) {
        self.lock().job_outcome = outcome;
    }

    /// Sets the log returned for every job.
    pub fn set_job_logs(&self, logs: impl Into<String>) {
        self.lock().job_logs = logs.into();
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Returns a workload's current observation.
    #[must_use]
    pub fn workload(&self, name: &str) -> Option<Workload> {
        self.lock().workloads.get(name).map(|r| r.workload.clone())
    }

    /// Returns the descriptor a workload was created from.
    #[must_use]
    pub fn workload_descriptor(&self, name: &str) -> Option<WorkloadDescriptor> {
        self.lock().workloads.get(name).map(|r| r.descriptor.clone())
    }

    /// Names of existing workloads.
    #[must_use]
    pub fn workload_names(&self) -> Vec<String> {
        self.lock().workloads.keys().cloned().collect()
    }

    /// Number of workload creations accepted so far.
    #[must_use]
    pub fn workloads_created(&self) -> usize {
        self.lock().workloads_created
    }

    /// Returns an existing artifact.
    #[must_use]
    pub fn artifact(&self, name: &str) -> Option<ArtifactDescriptor> {
        self.lock().artifacts.get(name).cloned()
    }

    /// Names of existing artifacts.
    #[must_use]
    pub fn artifact_names(&self) -> Vec<String> {
        self.lock().artifacts.keys().cloned().collect()
    }

    /// Names of existing volume claims.
    #[must_use]
    pub fn claim_names(&self) -> Vec<String> {
        self.lock().claims.keys().cloned().collect()
    }

    /// Names of existing jobs.
    #[must_use]
    pub fn job_names(&self) -> Vec<String> {
        self.lock().jobs.keys().cloned().collect()
    }

    /// Every job ever submitted, in order.
    #[must_use]
    pub fn job_history(&self) -> Vec<JobDescriptor> {
        self.lock().job_history.clone()
    }

    /// Every exec request, in order.
    #[must_use]
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        self.lock().exec_log.clone()
    }

    /// Bytes written to a workload's stdin so far.
    #[must_use]
    pub fn stdin_received(&self, name: &str) -> Vec<u8> {
        let stdin = self.lock().workloads.get(name).map(|r| r.stdin.clone());
        stdin
            .map(|buf| buf.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }
}

fn tail(text: &str, lines: Option<i64>) -> String {
    match lines {
        Some(n) if n >= 0 => {
            let all: Vec<&str> = text.lines().collect();
            let start = all.len().saturating_sub(usize::try_from(n).unwrap_or(usize::MAX));
            all[start..].join("\n")
        }
        _ => text.to_string(),
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_artifact(&self, _namespace: &str, artifact: &ArtifactDescriptor) -> Result<()> {
        let mut state = self.lock();
        if state.artifacts.contains_key(&artifact.name) {
            return Err(Error::AlreadyExists {
                resource: "artifact".to_string(),
                name: artifact.name.clone(),
            });
        }
        state
            .artifacts
            .insert(artifact.name.clone(), artifact.clone());
        Ok(())
    }

    async fn delete_artifacts(&self, _namespace: &str, selector: &LabelSelector) -> Result<()> {
        self.lock()
            .artifacts
            .retain(|_, artifact| !selector.matches(&artifact.labels));
        Ok(())
    }

    async fn create_volume_claim(
        &self,
        _namespace: &str,
        claim: &VolumeClaimDescriptor,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.claims.contains_key(&claim.name) {
            return Err(Error::AlreadyExists {
                resource: "volume claim".to_string(),
                name: claim.name.clone(),
            });
        }
        state.claims.insert(claim.name.clone(), claim.clone());
        Ok(())
    }

    async fn delete_volume_claims(&self, _namespace: &str, selector: &LabelSelector) -> Result<()> {
        self.lock()
            .claims
            .retain(|_, claim| !selector.matches(&claim.labels));
        Ok(())
    }

    async fn create_workload(
        &self,
        namespace: &str,
        descriptor: &WorkloadDescriptor,
    ) -> Result<Workload> {
        if self.fail_workload_creates.load(Ordering::SeqCst) {
            return Err(Error::api(
                "create",
                format!("workload {}", descriptor.name),
                "admission rejected",
            ));
        }
        let running = self.auto_start.load(Ordering::SeqCst);
        let workload = Workload {
            name: descriptor.name.clone(),
            namespace: namespace.to_string(),
            labels: descriptor.labels.clone(),
            annotations: descriptor.annotations.clone(),
            phase: if running {
                WorkloadPhase::Running
            } else {
                WorkloadPhase::Pending
            },
            primary: Some(if running {
                ContainerState::Running
            } else {
                ContainerState::Waiting {
                    reason: "ContainerCreating".to_string(),
                }
            }),
            image: descriptor.primary.image.clone(),
            command: descriptor.primary.command.clone(),
            created_at: Some(Utc::now()),
            deleting: false,
            message: None,
        };

        let mut state = self.lock();
        if state.workloads.contains_key(&descriptor.name) {
            return Err(Error::AlreadyExists {
                resource: "workload".to_string(),
                name: descriptor.name.clone(),
            });
        }
        state.workloads.insert(
            descriptor.name.clone(),
            WorkloadRecord {
                workload: workload.clone(),
                descriptor: descriptor.clone(),
                stdout: OutputPipe::new(),
                stderr: OutputPipe::new(),
                stdin: Arc::new(Mutex::new(Vec::new())),
                log: Vec::new(),
            },
        );
        state.workloads_created += 1;
        let _ = self.events.send((
            descriptor.name.clone(),
            WorkloadEvent::Applied(workload.clone()),
        ));
        debug!(workload = %descriptor.name, running, "Created in-memory workload");
        Ok(workload)
    }

    async fn get_workload(&self, _namespace: &str, name: &str) -> Result<Option<Workload>> {
        Ok(self.workload(name))
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Workload>> {
        Ok(self
            .lock()
            .workloads
            .values()
            .filter(|r| r.workload.namespace == namespace && selector.matches(&r.workload.labels))
            .map(|r| r.workload.clone())
            .collect())
    }

    async fn delete_workload(
        &self,
        _namespace: &str,
        name: &str,
        _grace_period_secs: Option<u32>,
    ) -> Result<()> {
        let mut state = self.lock();
        self.remove(&mut state, name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("workload", name))
    }

    async fn delete_workloads(&self, namespace: &str, selector: &LabelSelector) -> Result<()> {
        let mut state = self.lock();
        let names: Vec<String> = state
            .workloads
            .values()
            .filter(|r| r.workload.namespace == namespace && selector.matches(&r.workload.labels))
            .map(|r| r.workload.name.clone())
            .collect();
        for name in names {
            self.remove(&mut state, &name);
        }
        Ok(())
    }

    async fn watch_workload(&self, _namespace: &str, name: &str) -> Result<WorkloadEventStream> {
        if self.fail_watches.load(Ordering::SeqCst) {
            return Err(Error::api(
                "watch",
                format!("workload {name}"),
                "watch subscription refused",
            ));
        }
        // Subscribe and snapshot under one lock so no event falls in between.
        let (mut events, current) = {
            let state = self.lock();
            let current = state
                .workloads
                .get(name)
                .map(|r| r.workload.clone())
                .ok_or_else(|| Error::not_found("workload", name))?;
            (self.events.subscribe(), current)
        };
        let name = name.to_string();

        let stream = async_stream::stream! {
            yield Ok(WorkloadEvent::Applied(current));
            loop {
                match events.recv().await {
                    Ok((target, event)) if target == name => {
                        let deleted = matches!(event, WorkloadEvent::Deleted(_));
                        yield Ok(event);
                        if deleted {
                            return;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn exec(
        &self,
        _namespace: &str,
        name: &str,
        _container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let responder = {
            let mut state = self.lock();
            if !state.workloads.contains_key(name) {
                return Err(Error::not_found("workload", name));
            }
            state.exec_log.push((name.to_string(), command.to_vec()));
            state.exec_responder.clone()
        };
        Ok(responder(name, command))
    }

    async fn attach_output(
        &self,
        _namespace: &str,
        name: &str,
        _container: &str,
    ) -> Result<AttachedOutput> {
        let mut state = self.lock();
        let record = state
            .workloads
            .get_mut(name)
            .ok_or_else(|| Error::not_found("workload", name))?;
        Ok(AttachedOutput {
            stdout: record
                .stdout
                .reader
                .take()
                .map(|r| Box::new(r) as super::BoxedReader),
            stderr: record
                .stderr
                .reader
                .take()
                .map(|r| Box::new(r) as super::BoxedReader),
        })
    }

    async fn attach_stdin(
        &self,
        _namespace: &str,
        name: &str,
        _container: &str,
    ) -> Result<BoxedWriter> {
        let sink = self
            .lock()
            .workloads
            .get(name)
            .map(|r| r.stdin.clone())
            .ok_or_else(|| Error::not_found("workload", name))?;
        let (writer, mut reader) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&buf[..n]),
                }
            }
        });
        Ok(Box::new(writer))
    }

    async fn logs(
        &self,
        _namespace: &str,
        name: &str,
        _container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String> {
        let state = self.lock();
        let record = state
            .workloads
            .get(name)
            .ok_or_else(|| Error::not_found("workload", name))?;
        Ok(tail(&String::from_utf8_lossy(&record.log), tail_lines))
    }

    async fn port_forward(&self, _namespace: &str, name: &str, port: u16) -> Result<BoxedDuplex> {
        let delay = self.lock().port_forward_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let state = self.lock();
            let record = state
                .workloads
                .get(name)
                .ok_or_else(|| Error::not_found("workload", name))?;
            if !record.descriptor.primary.ports.contains(&port) {
                return Err(Error::Tunnel {
                    port,
                    reason: "connection refused".to_string(),
                });
            }
        }
        // The remote end echoes everything it receives.
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut rx, &mut tx).await;
        });
        Ok(Box::new(local))
    }

    async fn create_job(&self, _namespace: &str, job: &JobDescriptor) -> Result<()> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.name) {
            return Err(Error::AlreadyExists {
                resource: "job".to_string(),
                name: job.name.clone(),
            });
        }
        state.jobs.insert(job.name.clone(), JobRecord { polls: 0 });
        state.job_history.push(job.clone());
        Ok(())
    }

    async fn job_state(&self, _namespace: &str, name: &str) -> Result<JobState> {
        let mut state = self.lock();
        let outcome = state.job_outcome.clone();
        let record = state
            .jobs
            .get_mut(name)
            .ok_or_else(|| Error::not_found("job", name))?;
        record.polls += 1;
        Ok(if record.polls <= 1 {
            JobState::Active
        } else {
            outcome
        })
    }

    async fn job_logs(
        &self,
        _namespace: &str,
        name: &str,
        _container: &str,
        tail_lines: i64,
    ) -> Result<String> {
        let state = self.lock();
        if !state.jobs.contains_key(name) {
            return Err(Error::not_found("job", name));
        }
        Ok(tail(&state.job_logs, Some(tail_lines)))
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<()> {
        self.lock()
            .jobs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("job", name))
    }

    async fn health(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::api("health", "cluster", "unreachable"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ContainerDescriptor;

    fn descriptor(name: &str) -> WorkloadDescriptor {
        WorkloadDescriptor {
            name: name.to_string(),
            labels: BTreeMap::from([("session".to_string(), name.to_string())]),
            annotations: BTreeMap::new(),
            init_steps: vec![],
            primary: ContainerDescriptor {
                name: "main".into(),
                image: "alpine".into(),
                ports: vec![80],
                ..Default::default()
            },
            volumes: vec![],
        }
    }

    #[tokio::test]
    async fn test_watch_starts_with_current_state_and_ends_on_delete() {
        let cluster = MemoryCluster::new();
        cluster.create_workload("ns", &descriptor("w1")).await.unwrap();

        let mut events = cluster.watch_workload("ns", "w1").await.unwrap();
        let first = events.next().await.unwrap().unwrap();
        assert!(matches!(
            first,
            WorkloadEvent::Applied(ref w) if w.phase == WorkloadPhase::Running
        ));

        cluster.delete_workload("ns", "w1", Some(0)).await.unwrap();
        let second = events.next().await.unwrap().unwrap();
        assert!(matches!(second, WorkloadEvent::Deleted(_)));
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn test_output_reaches_eof_after_complete() {
        let cluster = MemoryCluster::new();
        cluster.create_workload("ns", &descriptor("w1")).await.unwrap();
        let output = cluster.attach_output("ns", "w1", "main").await.unwrap();

        cluster.write_stdout("w1", b"hello").await.unwrap();
        cluster.complete("w1", 0).await.unwrap();

        let mut out = Vec::new();
        let mut stdout = output.stdout.unwrap();
        stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(cluster.workload("w1").unwrap().exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_selector_delete_spares_others() {
        let cluster = MemoryCluster::new();
        cluster.create_workload("ns", &descriptor("a")).await.unwrap();
        cluster.create_workload("ns", &descriptor("b")).await.unwrap();
        let selector = LabelSelector::new().with("session", "a");
        cluster.delete_workloads("ns", &selector).await.unwrap();
        assert_eq!(cluster.workload_names(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_port_forward_rejects_undeclared_port() {
        let cluster = MemoryCluster::new();
        cluster.create_workload("ns", &descriptor("w1")).await.unwrap();
        assert!(cluster.port_forward("ns", "w1", 80).await.is_ok());
        assert!(matches!(
            cluster.port_forward("ns", "w1", 81).await,
            Err(Error::Tunnel { port: 81, .. })
        ));
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc", Some(2)), "b\nc");
        assert_eq!(tail("a\nb", Some(5)), "a\nb");
        assert_eq!(tail("a\nb", None), "a\nb");
    }
}
