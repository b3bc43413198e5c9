//! The Docker operations the rest of the crate depends on.

use async_trait::async_trait;
use bytes::Bytes;

use crate::docker::error::Result;
use crate::docker::types::{ContainerInspect, ContainerSpec, ExecInspect, ExecSpec, VersionInfo};
use crate::docker::upgrade::ExecConnection;

/// Docker Engine API surface used by sessions, the sidecar manager and the
/// orchestrator.
///
/// [`DockerClient`](crate::docker::DockerClient) implements this over the
/// Engine's Unix socket. Every call is a single attempt: callers decide what
/// to retry and which errors (typically 404 on removal) count as success.
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Check the daemon responds.
    async fn ping(&self) -> Result<()>;

    /// Report daemon version information.
    async fn version(&self) -> Result<VersionInfo>;

    /// Pull an image. Pulling an image that is already present succeeds.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String>;

    /// Start a container. Starting a running container succeeds.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, killing it after `timeout_secs`.
    async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()>;

    /// Remove a container and its anonymous volumes.
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// Inspect a container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect>;

    /// Create a bridge network and return its id.
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Remove a network.
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Connect a container to a network under the given DNS aliases.
    async fn connect_network(&self, network: &str, container: &str, aliases: &[String])
    -> Result<()>;

    /// Create a named volume and return its name.
    async fn create_volume(&self, name: &str) -> Result<String>;

    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Extract a tar archive into `path` inside the container.
    async fn upload_archive(&self, container: &str, path: &str, archive: Bytes) -> Result<()>;

    /// Create an exec instance and return its id.
    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String>;

    /// Start an exec instance over a raw upgraded connection.
    async fn start_exec_stream(&self, exec_id: &str, tty: bool) -> Result<ExecConnection>;

    /// Inspect an exec instance (pid, exit code, running flag).
    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect>;

    /// Resize an exec instance's pseudo-terminal.
    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()>;
}
