//! Workload watcher.
//!
//! One watcher task per active session converts the workload's event stream
//! into handle transitions:
//!
//! | Event | Effect |
//! |-------|--------|
//! | subscription fails | `Failed` exit with the error, stop |
//! | workload deleted, or already gone at subscription | `Killed` exit (137), remove handle from registry, stop |
//! | phase `Succeeded` / `Failed` | exit with the primary's code, keep handle registered |
//! | primary running | `Pending → Running` |
//! | cancellation / stream end | stop silently |
//!
//! Repeated terminal events are harmless: only the first
//! [`Handle::signal_exit`] has an effect.

use super::handle::Handle;
use super::registry::SessionRegistry;
use super::state::ExitResult;
use crate::cluster::{Cluster, ContainerState, WorkloadEvent, WorkloadPhase};
use crate::constants::UNKNOWN_EXIT_CODE;
use crate::error::Error;
use futures::StreamExt;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Background observer for one session.
pub struct Watcher;

impl Watcher {
    /// Starts watching `handle`'s workload. Cancelled through the handle.
    pub fn spawn(
        cluster: Arc<dyn Cluster>,
        handle: Arc<Handle>,
        registry: Arc<SessionRegistry>,
    ) -> JoinHandle<()> {
        tokio::spawn(run(cluster, handle, registry))
    }
}

async fn run(cluster: Arc<dyn Cluster>, handle: Arc<Handle>, registry: Arc<SessionRegistry>) {
    let cancel = handle.watcher_token();
    let subscribed = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        subscribed = cluster.watch_workload(handle.namespace(), handle.workload_name()) => subscribed,
    };
    let mut events = match subscribed {
        Ok(events) => events,
        Err(e) => {
            subscription_failed(&handle, &registry, e).await;
            return;
        }
    };

    let mut received = false;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(session = %handle.id(), "Watcher cancelled");
                return;
            }
            next = events.next() => next,
        };
        match next {
            None => {
                debug!(session = %handle.id(), "Watch stream ended");
                return;
            }
            Some(Err(e)) if !received => {
                subscription_failed(&handle, &registry, e).await;
                return;
            }
            Some(Err(e)) => {
                warn!(session = %handle.id(), error = %e, "Watch stream failed");
                return;
            }
            Some(Ok(event)) => {
                received = true;
                if apply(&handle, &registry, event).await.is_break() {
                    return;
                }
            }
        }
    }
}

/// A workload that no longer exists was deleted; anything else fails the session.
async fn subscription_failed(handle: &Arc<Handle>, registry: &SessionRegistry, err: Error) {
    if err.is_not_found() {
        debug!(session = %handle.id(), "Workload gone before the watch started");
        handle.signal_exit(ExitResult::killed()).await;
        registry.remove_if_same(handle);
        return;
    }
    warn!(session = %handle.id(), error = %err, "Watch subscription failed");
    handle
        .signal_exit(ExitResult::failure(format!("watch failed: {err}")))
        .await;
}

async fn apply(
    handle: &Arc<Handle>,
    registry: &SessionRegistry,
    event: WorkloadEvent,
) -> ControlFlow<()> {
    match event {
        WorkloadEvent::Deleted(_) => {
            handle.signal_exit(ExitResult::killed()).await;
            // Removal strictly after signalling.
            registry.remove_if_same(handle);
            ControlFlow::Break(())
        }
        WorkloadEvent::Applied(workload) => {
            match workload.phase {
                WorkloadPhase::Succeeded => {
                    let code = workload.exit_code().unwrap_or(0);
                    handle.signal_exit(ExitResult::exited(code)).await;
                }
                WorkloadPhase::Failed => {
                    let result = match workload.exit_code() {
                        Some(code) => ExitResult::exited(code),
                        None => ExitResult {
                            exit_code: UNKNOWN_EXIT_CODE,
                            error: Some(
                                workload
                                    .message
                                    .unwrap_or_else(|| "workload failed".to_string()),
                            ),
                            killed: false,
                        },
                    };
                    handle.signal_exit(result).await;
                }
                WorkloadPhase::Running | WorkloadPhase::Pending | WorkloadPhase::Unknown => {
                    if matches!(workload.primary, Some(ContainerState::Running)) {
                        handle.mark_running();
                    }
                }
            }
            ControlFlow::Continue(())
        }
    }
}
