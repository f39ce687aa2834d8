//! # magikube
//!
//! **Kubernetes Session Backend**
//!
//! This crate runs user commands as isolated, observable sessions on a
//! Kubernetes cluster. Each session is one workload (pod) whose output can be
//! streamed, whose ports can be tunnelled to localhost, and whose lifecycle
//! ends exactly once with a definitive exit result. A companion builder turns
//! declarative build specs into content-addressed images.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             magikube                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                  SessionBackend Trait                       │    │
//! │  │   run → attach / get / list → stop / kill → destroy         │    │
//! │  │                exec │ health │ close                        │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                    Session Layer                          │      │
//! │  │  Handle (streams, stdin, tunnels, exit-once)              │      │
//! │  │  Watcher (cluster events → exit)  │  Registry (live ids)  │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                    Image Builder                          │      │
//! │  │  BuildSpec → plan + content tag → build job → reference   │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                         Cluster Trait                               │
//! │  ┌──────────────────────────┐      ┌──────────────────────────┐     │
//! │  │       KubeCluster        │      │      MemoryCluster       │     │
//! │  │  pods, config maps, PVCs │      │  scriptable, in-process  │     │
//! │  │  jobs, exec, portforward │      │  same error contract     │     │
//! │  └──────────────────────────┘      └──────────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Session Lifecycle
//!
//! ```text
//!   ┌─────────┐  primary running  ┌─────────┐   stop    ┌──────────┐
//!   │ Pending │ ────────────────► │ Running │ ────────► │ Stopping │
//!   └────┬────┘                   └────┬────┘           └────┬─────┘
//!        │                             │                     │
//!        │     exit 0 → Stopped        │                     │
//!        └──── exit ≠ 0 / error → Failed ◄───────────────────┘
//!              deleted / kill → Killed (137)
//! ```
//!
//! Every terminal transition goes through [`Handle::signal_exit`], which
//! delivers at most one [`ExitResult`] per session, after all output has
//! been drained into the session's streams.
//!
//! # Resource Tagging
//!
//! Every object created for a session carries:
//!
//! | Label | Value |
//! |-------|-------|
//! | [`MANAGED_BY_LABEL`](constants::MANAGED_BY_LABEL) | `magikube` |
//! | [`SESSION_ID_LABEL`](constants::SESSION_ID_LABEL) | session id |
//! | user labels | as given |
//!
//! Rollback, `destroy` and `list` all select by these labels, so a session
//! can be found and removed by a process that never created it.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikube::{BackendConfig, ClusterBackend, KubeCluster, SessionBackend, SessionSpec};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> magikube::Result<()> {
//!     let cluster = Arc::new(KubeCluster::try_default().await?);
//!     let backend = ClusterBackend::new(cluster, BackendConfig::from_env()?);
//!
//!     let spec = SessionSpec::new("alpine:3.20").with_command(["echo", "hi"]);
//!     let handle = backend.run(spec).await?;
//!     let exit = handle.exited().await;
//!     let output = handle.stdout().read_to_end().await;
//!     backend.destroy(handle.id()).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod build;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod files;
pub mod session;

// Re-exports
pub use backend::{ClusterBackend, SessionBackend};
pub use build::{render_plan, BuildPlan, BuildSpec, BuiltImage, ImageBuilder};
pub use cluster::{Cluster, KubeCluster, MemoryCluster};
pub use config::{BackendConfig, BuilderConfig};
pub use error::{Error, ErrorKind, Result};
pub use files::FileEntry;
pub use session::{
    ExecResult, ExitReceiver, ExitResult, Handle, ListFilter, SessionId, SessionInfo,
    SessionSpec, SessionStatus, Stdin,
};
