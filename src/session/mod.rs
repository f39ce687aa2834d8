//! # Sessions
//!
//! A session is one execution of a user command inside an isolated workload,
//! tracked end-to-end by a stable [`SessionId`].
//!
//! ```text
//!                 ┌──────────────────────── Handle ───────────────────────┐
//!  cluster ──────▶│ copy tasks ──▶ stdout / stderr (BufferedStream)       │──▶ readers
//!  output         │                                                       │
//!                 │ status, exit code, tunnels   (Mutex)                  │──▶ info()
//!  cluster ──────▶│ Watcher ──▶ signal_exit() ──▶ exit channel (once)     │──▶ wait()
//!  events         └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!   Pending ──▶ Running ──▶ Stopping ──▶ Stopped
//!      │           │            │
//!      └───────────┴────────────┴──▶ Failed | Killed
//! ```
//!
//! Terminal states are final: the first terminal signal wins, later ones
//! are ignored.

mod handle;
mod registry;
mod spec;
mod state;
mod stream;
mod tunnel;
mod watcher;
pub(crate) mod workload;

pub use handle::{workload_name, ExitReceiver, Handle, Stdin};
pub use registry::SessionRegistry;
pub use spec::{Resources, SessionSpec, VolumeSpec};
pub use state::{ExecResult, ExitResult, ListFilter, SessionId, SessionInfo, SessionStatus};
pub use stream::BufferedStream;
pub use tunnel::PortTunnel;
pub use watcher::Watcher;
