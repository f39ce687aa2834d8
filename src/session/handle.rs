//! Per-session handle.
//!
//! A `Handle` owns one session's mutable state and I/O surface:
//!
//! | Piece | Type | Notes |
//! |-------|------|-------|
//! | status, exit code, exit error, tunnels | `Mutex<HandleState>` | snapshot via [`Handle::info`] |
//! | stdin | [`Stdin`] | no-op sink until attached |
//! | stdout / stderr | [`BufferedStream`] | fed by copy tasks |
//! | exit | `watch` channel | exactly one value, ever |
//! | watcher | `CancellationToken` | cancelled on close |
//!
//! ## Exit Signalling
//!
//! [`Handle::signal_exit`] is the only path to a terminal state. The first
//! call flips the status under the state lock; every later call observes a
//! terminal status and returns without effect. The winner drains the output
//! copy tasks, finishes both streams and only then publishes the result, so
//! a waiter that wakes up can read the complete output.

use super::spec::SessionSpec;
use super::state::{ExitResult, SessionId, SessionInfo, SessionStatus};
use super::stream::BufferedStream;
use super::tunnel::PortTunnel;
use crate::cluster::{AttachedOutput, BoxedReader, BoxedWriter, Cluster};
use crate::config::BackendConfig;
use crate::constants::{STREAM_COPY_CHUNK, WORKLOAD_NAME_PREFIX};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Returns the workload name for a session id.
#[must_use]
pub fn workload_name(id: &SessionId) -> String {
    format!("{WORKLOAD_NAME_PREFIX}-{id}")
}

// =============================================================================
// Stdin
// =============================================================================

enum StdinSink {
    Detached,
    Attached(BoxedWriter),
    Closed,
}

/// Session stdin.
///
/// Writes before a real input stream is attached are accepted and discarded,
/// so early writers never block or fail.
#[derive(Clone)]
pub struct Stdin {
    sink: Arc<AsyncMutex<StdinSink>>,
}

impl std::fmt::Debug for Stdin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stdin").finish_non_exhaustive()
    }
}

impl Stdin {
    fn new() -> Self {
        Self {
            sink: Arc::new(AsyncMutex::new(StdinSink::Detached)),
        }
    }

    /// Writes all of `data`.
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` after [`Stdin::close`], or the attached writer's error.
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        match &mut *self.sink.lock().await {
            StdinSink::Detached => Ok(data.len()),
            StdinSink::Attached(writer) => {
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(data.len())
            }
            StdinSink::Closed => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stdin is closed",
            )),
        }
    }

    /// Returns true while a real input stream is attached.
    pub async fn is_attached(&self) -> bool {
        matches!(*self.sink.lock().await, StdinSink::Attached(_))
    }

    async fn attach(&self, writer: BoxedWriter) {
        let mut sink = self.sink.lock().await;
        if !matches!(*sink, StdinSink::Closed) {
            *sink = StdinSink::Attached(writer);
        }
    }

    /// Shuts down the attached writer. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.sink.lock().await, StdinSink::Closed);
        if let StdinSink::Attached(mut writer) = previous {
            let _ = writer.shutdown().await;
        }
    }
}

// =============================================================================
// Exit Receiver
// =============================================================================

/// Single-value receiver returned by [`Handle::wait`].
#[derive(Debug)]
pub struct ExitReceiver {
    rx: watch::Receiver<Option<ExitResult>>,
}

impl ExitReceiver {
    /// Waits for the exit result.
    ///
    /// Returns `None` only if the handle was dropped without ever exiting.
    pub async fn recv(mut self) -> Option<ExitResult> {
        self.rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|result| result.clone())
    }

    /// Returns the result if it has already been delivered.
    #[must_use]
    pub fn try_recv(&self) -> Option<ExitResult> {
        self.rx.borrow().clone()
    }
}

// =============================================================================
// Handle
// =============================================================================

struct HandleState {
    status: SessionStatus,
    exit_code: Option<i32>,
    exit_error: Option<String>,
    tunnels: HashMap<u16, Arc<PortTunnel>>,
}

/// Live state and I/O surface of one session.
pub struct Handle {
    id: SessionId,
    workload: String,
    namespace: String,
    spec: SessionSpec,
    created_at: DateTime<Utc>,
    reconstructed: bool,
    cluster: Arc<dyn Cluster>,
    tunnel_timeout: Duration,
    drain_timeout: Duration,
    state: Mutex<HandleState>,
    stdin: Stdin,
    stdout: Arc<BufferedStream>,
    stderr: Arc<BufferedStream>,
    exit_tx: watch::Sender<Option<ExitResult>>,
    watcher_cancel: CancellationToken,
    copy_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("workload", &self.workload)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Handle {
    /// Creates a `Pending` handle for a freshly scheduled workload.
    pub fn new(
        id: SessionId,
        namespace: impl Into<String>,
        spec: SessionSpec,
        cluster: Arc<dyn Cluster>,
        config: &BackendConfig,
    ) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            workload: workload_name(&id),
            id,
            namespace: namespace.into(),
            spec,
            created_at: Utc::now(),
            reconstructed: false,
            cluster,
            tunnel_timeout: config.tunnel_timeout,
            drain_timeout: config.stream_drain_timeout,
            state: Mutex::new(HandleState {
                status: SessionStatus::Pending,
                exit_code: None,
                exit_error: None,
                tunnels: HashMap::new(),
            }),
            stdin: Stdin::new(),
            stdout: Arc::new(BufferedStream::new()),
            stderr: Arc::new(BufferedStream::new()),
            exit_tx,
            watcher_cancel: CancellationToken::new(),
            copy_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the handle as rebuilt from cluster metadata.
    #[must_use]
    pub(crate) fn into_reconstructed(
        mut self,
        workload: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        self.workload = workload;
        self.created_at = created_at;
        self.reconstructed = true;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Workload name.
    #[must_use]
    pub fn workload_name(&self) -> &str {
        &self.workload
    }

    /// Namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Originating specification.
    #[must_use]
    pub fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    /// Current status.
    ///
    /// A terminal status is recorded before output is drained; use
    /// [`Handle::exited`] or [`Handle::wait`] to observe completion.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    /// Exit code, once terminal.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit_code
    }

    /// Session stdin.
    #[must_use]
    pub fn stdin(&self) -> &Stdin {
        &self.stdin
    }

    /// Buffered stdout.
    #[must_use]
    pub fn stdout(&self) -> Arc<BufferedStream> {
        self.stdout.clone()
    }

    /// Buffered stderr.
    #[must_use]
    pub fn stderr(&self) -> Arc<BufferedStream> {
        self.stderr.clone()
    }

    /// Returns true once [`Handle::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote ports with an open tunnel.
    #[must_use]
    pub fn tunnel_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock_state().tunnels.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Token the watcher observes for cancellation.
    pub(crate) fn watcher_token(&self) -> CancellationToken {
        self.watcher_cancel.clone()
    }

    /// Snapshot of the session.
    ///
    /// Like [`Handle::status`], may report a terminal status while streams
    /// are still draining.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        let state = self.lock_state();
        SessionInfo {
            id: self.id.clone(),
            workload: self.workload.clone(),
            namespace: self.namespace.clone(),
            image: self.spec.image.clone(),
            command: self.spec.command.clone(),
            labels: self.spec.labels.clone(),
            status: state.status,
            exit_code: state.exit_code,
            error: state.exit_error.clone(),
            created_at: self.created_at,
            reconstructed: self.reconstructed,
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// `Pending → Running`. Returns true if the status changed.
    pub fn mark_running(&self) -> bool {
        let mut state = self.lock_state();
        if state.status == SessionStatus::Pending {
            state.status = SessionStatus::Running;
            debug!(session = %self.id, "Session running");
            true
        } else {
            false
        }
    }

    /// Any non-terminal status `→ Stopping`. Returns true if the status changed.
    pub fn mark_stopping(&self) -> bool {
        let mut state = self.lock_state();
        if state.status.is_terminal() || state.status == SessionStatus::Stopping {
            false
        } else {
            state.status = SessionStatus::Stopping;
            true
        }
    }

    /// Applies a terminal outcome. Only the first call has an effect.
    ///
    /// Returns true if this call delivered the result.
    pub async fn signal_exit(&self, result: ExitResult) -> bool {
        {
            let mut state = self.lock_state();
            if state.status.is_terminal() {
                debug!(session = %self.id, status = %state.status, "Exit already signalled");
                return false;
            }
            state.status = result.status();
            state.exit_code.get_or_insert(result.exit_code);
            state.exit_error.clone_from(&result.error);
        }

        self.drain_output(result.killed).await;
        self.stdout.finish();
        self.stderr.finish();

        info!(
            session = %self.id,
            status = %result.status(),
            exit_code = result.exit_code,
            "Session exited"
        );
        self.exit_tx.send_replace(Some(result));
        true
    }

    /// Waits for copy tasks to reach EOF; a killed workload produces no more
    /// output, so its tasks are aborted instead.
    async fn drain_output(&self, abort: bool) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.copy_tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for mut task in tasks {
            if abort {
                task.abort();
                continue;
            }
            if tokio::time::timeout(self.drain_timeout, &mut task).await.is_err() {
                debug!(session = %self.id, "Output drain timed out");
                task.abort();
            }
        }
    }

    /// Returns a receiver for the exit result.
    #[must_use]
    pub fn wait(&self) -> ExitReceiver {
        ExitReceiver {
            rx: self.exit_tx.subscribe(),
        }
    }

    /// Resolves once the session reached a terminal state.
    pub async fn exited(&self) -> Option<ExitResult> {
        self.wait().recv().await
    }

    // =========================================================================
    // I/O Wiring
    // =========================================================================

    /// Feeds raw output sources into the buffered streams.
    ///
    /// An absent source contributes nothing; its stream ends when the session
    /// exits.
    pub fn set_attach_streams(&self, output: AttachedOutput) {
        let mut tasks = self
            .copy_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(source) = output.stdout {
            tasks.push(spawn_copy(source, self.stdout.clone(), self.id.clone()));
        }
        if let Some(source) = output.stderr {
            tasks.push(spawn_copy(source, self.stderr.clone(), self.id.clone()));
        }
    }

    /// Connects a real input stream to [`Handle::stdin`].
    pub async fn attach_stdin(&self, writer: BoxedWriter) {
        self.stdin.attach(writer).await;
    }

    /// Returns the access URL for `port`, opening a tunnel on first use.
    ///
    /// # Errors
    ///
    /// See [`PortTunnel::open`]; [`Error::InvalidInput`] once the handle is closed.
    pub async fn url(&self, port: u16) -> Result<String> {
        if let Some(tunnel) = self.lock_state().tunnels.get(&port) {
            return Ok(tunnel.url());
        }
        if self.is_closed() {
            return Err(Error::InvalidInput(format!(
                "session '{}' is closed",
                self.id
            )));
        }

        let tunnel = PortTunnel::open(
            self.cluster.clone(),
            &self.namespace,
            &self.workload,
            port,
            self.tunnel_timeout,
        )
        .await?;

        let mut state = self.lock_state();
        // close() sets the flag before draining under this lock.
        if self.is_closed() {
            tunnel.close();
            return Err(Error::InvalidInput(format!(
                "session '{}' is closed",
                self.id
            )));
        }
        // A concurrent caller may have won; the loser's tunnel closes on drop.
        let tunnel = state
            .tunnels
            .entry(port)
            .or_insert_with(|| Arc::new(tunnel));
        Ok(tunnel.url())
    }

    /// Releases every resource held by the handle. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(session = %self.id, "Handle already closed");
            return;
        }
        self.watcher_cancel.cancel();

        let tunnels: Vec<Arc<PortTunnel>> =
            self.lock_state().tunnels.drain().map(|(_, t)| t).collect();
        for tunnel in tunnels {
            tunnel.close();
        }

        self.stdin.close().await;
        for task in self
            .copy_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.stdout.close();
        self.stderr.close();
        debug!(session = %self.id, "Handle closed");
    }
}

fn spawn_copy(mut source: BoxedReader, sink: Arc<BufferedStream>, id: SessionId) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; STREAM_COPY_CHUNK];
        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if sink.write(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session = %id, error = %e, "Output source failed");
                    break;
                }
            }
        }
    })
}
