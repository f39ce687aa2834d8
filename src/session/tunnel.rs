//! On-demand local port tunnels.
//!
//! A tunnel binds `127.0.0.1:0` and forwards every accepted connection to a
//! port inside the workload through its own port-forward stream.
//!
//! ```text
//! client ──TCP──▶ 127.0.0.1:<ephemeral> ──port_forward──▶ workload:<port>
//! ```
//!
//! Establishment is bounded: it either becomes ready (local port assigned),
//! fails with a tunnel or not-found error, or times out.

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A running tunnel. Dropping it stops the listener and open connections.
#[derive(Debug)]
pub struct PortTunnel {
    remote_port: u16,
    local_port: u16,
    cancel: CancellationToken,
}

impl PortTunnel {
    /// Establishes a tunnel to `port` inside `workload`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the workload does not exist
    /// - [`Error::Tunnel`] if the workload has ended or the port refuses
    /// - [`Error::Timeout`] if establishment exceeds `timeout`
    pub async fn open(
        cluster: Arc<dyn Cluster>,
        namespace: &str,
        workload: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let establish = async {
            let observed = cluster
                .get_workload(namespace, workload)
                .await?
                .ok_or_else(|| Error::not_found("workload", workload))?;
            if observed.deleting || observed.phase.is_terminal() {
                return Err(Error::Tunnel {
                    port,
                    reason: format!("workload is {}", observed.phase),
                });
            }
            // Probe once so an unreachable port fails here, not on first use.
            drop(cluster.port_forward(namespace, workload, port).await?);
            Ok(TcpListener::bind(("127.0.0.1", 0)).await?)
        };

        let listener = match tokio::time::timeout(timeout, establish).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: format!("tunnel to {workload}:{port}"),
                    duration: timeout,
                });
            }
        };
        let local_port = listener.local_addr()?.port();
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            cluster,
            namespace.to_string(),
            workload.to_string(),
            port,
            cancel.clone(),
        ));

        info!(workload, port, local_port, "Port tunnel ready");
        Ok(Self {
            remote_port: port,
            local_port,
            cancel,
        })
    }

    /// Port inside the workload.
    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Locally bound port.
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Access URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }

    /// Stops accepting and tears down open connections.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PortTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    cluster: Arc<dyn Cluster>,
    namespace: String,
    workload: String,
    port: u16,
    cancel: CancellationToken,
) {
    loop {
        let (mut socket, peer) = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(workload = %workload, port, error = %e, "Tunnel accept failed");
                    break;
                }
            },
        };

        let cluster = cluster.clone();
        let namespace = namespace.clone();
        let workload = workload.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut remote = match cluster.port_forward(&namespace, &workload, port).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(workload = %workload, port, %peer, error = %e, "Port-forward failed");
                    return;
                }
            };
            tokio::select! {
                () = cancel.cancelled() => {}
                copied = tokio::io::copy_bidirectional(&mut socket, &mut remote) => {
                    if let Err(e) = copied {
                        debug!(workload = %workload, port, error = %e, "Tunnel connection ended");
                    }
                }
            }
        });
    }
    debug!(workload = %workload, port, "Tunnel closed");
}
