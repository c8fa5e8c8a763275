//! Workload Driver abstraction (spec.md §4.1).
//!
//! One uniform capability set, two providers: [`runtime`] (container
//! runtime, local CLI or remote socket-proxy daemon) and [`virt`]
//! (Proxmox-style virtualization REST API). Driver-specific configuration
//! never leaks into generic paths — each variant encapsulates its own
//! connection details, per the teacher's "don't thread adapter-specific
//! data through generic paths" convention (mirrors `AgentAdapter` in the
//! retrieved `oddjobs` daemon sample).

#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod registry;
pub mod runtime;
pub mod virt;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const STATUS_DEADLINE: Duration = Duration::from_secs(3);
pub const START_STOP_INITIATE_DEADLINE: Duration = Duration::from_secs(10);
pub const START_STOP_POLL_DEADLINE: Duration = Duration::from_secs(30);
pub const START_STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const START_STOP_POLL_ITERATIONS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver operation timed out")]
    Timeout,
    #[error("driver transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Uniform contract over a backend's control plane.
///
/// Errors are swallowed at the edges by design (spec.md §4.1 / §7): network
/// or timeout failures make `is_running` report `false`, and a failed
/// `start`/`stop` is logged and returned without raising past the calling
/// tick or request.
#[async_trait]
pub trait WorkloadDriver: Send + Sync {
    async fn is_running(&self, name: &str) -> bool;

    /// Starting an already-running workload is a no-op success.
    async fn start(&self, name: &str) -> Result<(), DriverError>;

    /// Stopping an already-stopped workload is a no-op success.
    async fn stop(&self, name: &str) -> Result<(), DriverError>;

    /// Errors yield an empty set rather than propagating.
    async fn list(&self) -> Vec<String>;

    async fn started_at(&self, name: &str) -> Option<DateTime<Utc>>;
}

/// Polls `is_running` until it reports the desired state or the deadline
/// elapses, used by drivers whose start/stop calls are fire-and-confirm
/// (spec.md §4.1: "poll `isRunning` for up to 30s at 1Hz").
pub async fn poll_until<D: WorkloadDriver + ?Sized>(driver: &D, name: &str, want_running: bool) {
    for _ in 0..START_STOP_POLL_ITERATIONS {
        if driver.is_running(name).await == want_running {
            return;
        }
        tokio::time::sleep(START_STOP_POLL_INTERVAL).await;
    }
}
