//! Tailscale sidecar lifecycle management using Docker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;

use crate::docker::{
    ContainerSpec, DockerApi, DockerError, ExecSpec, MANAGED_LABEL, exec_run, ignore_not_found,
};
use crate::sidecar::config::{STATE_DIR, SidecarEndpoint, TailscaleConfig};
use crate::sidecar::error::{Result, SidecarError};

/// Bound on each `tailscale` CLI call made inside the sidecar.
const CLI_TIMEOUT: Duration = Duration::from_secs(15);

/// Names and targets for one sandbox's sidecar.
#[derive(Debug, Clone)]
pub struct SidecarRequest {
    /// Container name for the sidecar.
    pub container_name: String,
    /// Named volume holding node state.
    pub volume_name: String,
    /// Application container whose network namespace the sidecar joins.
    pub app_container_id: String,
    /// Short sandbox id used in the node hostname.
    pub sandbox_short_id: String,
    /// Port inside the shared namespace to expose over HTTPS.
    pub serve_port: u16,
}

/// A running sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub container_id: String,
    pub volume_name: String,
    pub endpoint: SidecarEndpoint,
}

/// Creates, starts, stops and removes Tailscale sidecar containers.
///
/// The sidecar shares the application container's network namespace
/// (`NetworkMode: container:<id>`), so `tailscale serve` can proxy the
/// tailnet's HTTPS port straight to the app on loopback. Holds no
/// per-sandbox state; identifiers live on the sandbox record.
pub struct TailscaleManager {
    docker: Arc<dyn DockerApi>,
    config: TailscaleConfig,
}

impl TailscaleManager {
    /// Create a new sidecar manager.
    pub fn new(docker: Arc<dyn DockerApi>, config: TailscaleConfig) -> Self {
        Self { docker, config }
    }

    /// Get the configuration.
    pub fn config(&self) -> &TailscaleConfig {
        &self.config
    }

    /// Create, start and configure a sidecar, waiting until its node is up.
    ///
    /// A half-created sidecar is removed before the error returns.
    pub async fn create(&self, request: &SidecarRequest) -> Result<Sidecar> {
        let name = &request.container_name;

        // A container left over from an earlier failed attempt would hold the name.
        let _ = self.docker.remove_container(name, true).await;

        self.docker
            .pull_image(&self.config.image)
            .await
            .map_err(|e| SidecarError::ImagePullFailed {
                image: self.config.image.clone(),
                reason: e.to_string(),
            })?;

        self.docker
            .create_volume(&request.volume_name)
            .await
            .map_err(|e| SidecarError::VolumeCreationFailed {
                name: request.volume_name.clone(),
                reason: e.to_string(),
            })?;

        let hostname = self.config.hostname(&request.sandbox_short_id);
        let spec = self.container_spec(request, &hostname);
        let container_id = self
            .docker
            .create_container(name, &spec)
            .await
            .map_err(|e| SidecarError::ContainerCreationFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        match self.bring_up(&container_id, request).await {
            Ok(()) => {
                let endpoint = SidecarEndpoint {
                    fqdn: self.config.fqdn(&hostname),
                    hostname,
                    https_port: self.config.https_port,
                };
                tracing::info!(container = %name, endpoint = %endpoint, "Sidecar ready");
                Ok(Sidecar {
                    container_id,
                    volume_name: request.volume_name.clone(),
                    endpoint,
                })
            }
            Err(e) => {
                if let Err(cleanup) = ignore_not_found(self.docker.remove_container(&container_id, true).await) {
                    tracing::warn!(container = %name, "Failed to remove broken sidecar: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    fn container_spec(&self, request: &SidecarRequest, hostname: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(self.config.image.clone())
            .env("TS_AUTHKEY", self.config.auth_key.expose_secret())
            .env("TS_HOSTNAME", hostname)
            .env("TS_STATE_DIR", STATE_DIR)
            .env("TS_USERSPACE", "true")
            .label(MANAGED_LABEL, "true")
            .label("devsandbox.role", "tailscale");
        spec.host_config.network_mode = Some(format!("container:{}", request.app_container_id));
        spec.host_config.binds = vec![format!("{}:{}", request.volume_name, STATE_DIR)];
        spec
    }

    async fn bring_up(&self, container_id: &str, request: &SidecarRequest) -> Result<()> {
        let name = &request.container_name;
        self.docker
            .start_container(container_id)
            .await
            .map_err(|e| SidecarError::ContainerStartFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(container = %name, "Started sidecar container");

        self.wait_for_ready(container_id, name).await?;
        self.serve(container_id, name, request.serve_port).await
    }

    /// Poll `tailscale status` until the backend reports `Running`.
    async fn wait_for_ready(&self, container_id: &str, name: &str) -> Result<()> {
        let start = Instant::now();
        let timeout = self.config.startup_timeout;
        let interval = self.config.health_poll_interval;
        let mut last_state = String::from("unknown");

        while start.elapsed() < timeout {
            if let Ok(info) = self.docker.inspect_container(container_id).await
                && !info.state.running
            {
                return Err(SidecarError::ContainerStopped {
                    name: name.to_string(),
                });
            }

            match self.backend_state(container_id).await {
                Ok(state) if state == "Running" => return Ok(()),
                Ok(state) => last_state = state,
                Err(e) => tracing::trace!(container = %name, "Status check error: {}", e),
            }
            tokio::time::sleep(interval).await;
        }

        Err(SidecarError::HealthCheckFailed {
            name: name.to_string(),
            timeout,
            reason: format!("backend state still '{}'", last_state),
        })
    }

    async fn backend_state(&self, container_id: &str) -> std::result::Result<String, DockerError> {
        let spec = ExecSpec::new(["tailscale", "status", "--json"]);
        let output = exec_run(self.docker.as_ref(), container_id, &spec, CLI_TIMEOUT).await?;
        Ok(parse_backend_state(&output.output).unwrap_or_else(|| "unknown".to_string()))
    }

    async fn serve(&self, container_id: &str, name: &str, port: u16) -> Result<()> {
        let spec = ExecSpec::new(serve_command(self.config.https_port, port));
        let output = exec_run(self.docker.as_ref(), container_id, &spec, CLI_TIMEOUT).await?;
        if !output.success() {
            return Err(SidecarError::ServeFailed {
                name: name.to_string(),
                reason: format!("exit code {}: {}", output.exit_code, output.text().trim()),
            });
        }
        Ok(())
    }

    /// Start an existing sidecar. The node reconnects from its state volume.
    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.docker.start_container(container_id).await?;
        tracing::debug!(container = %container_id, "Sidecar started");
        Ok(())
    }

    /// Stop a sidecar. A missing container counts as stopped.
    pub async fn stop(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        stop_sidecar(self.docker.as_ref(), container_id, timeout_secs).await
    }

    /// Remove the sidecar container and its state volume. Missing
    /// resources count as removed.
    pub async fn destroy(&self, container: &str, volume_name: &str) -> Result<()> {
        remove_sidecar(self.docker.as_ref(), container, volume_name).await
    }
}

/// Stop a sidecar container without a manager.
///
/// Stopping needs no Tailscale configuration, so sandboxes provisioned while
/// sidecars were enabled can still be stopped after they are turned off.
pub async fn stop_sidecar(docker: &dyn DockerApi, container: &str, timeout_secs: u64) -> Result<()> {
    ignore_not_found(docker.stop_container(container, timeout_secs).await)?;
    tracing::debug!(container = %container, "Sidecar stopped");
    Ok(())
}

/// Remove a sidecar container and its state volume without a manager.
pub async fn remove_sidecar(docker: &dyn DockerApi, container: &str, volume_name: &str) -> Result<()> {
    ignore_not_found(docker.remove_container(container, true).await)?;
    ignore_not_found(docker.remove_volume(volume_name).await)?;
    tracing::info!(container = %container, volume = %volume_name, "Sidecar removed");
    Ok(())
}

fn serve_command(https_port: u16, target_port: u16) -> Vec<String> {
    vec![
        "tailscale".to_string(),
        "serve".to_string(),
        "--bg".to_string(),
        format!("--https={}", https_port),
        format!("http://127.0.0.1:{}", target_port),
    ]
}

fn parse_backend_state(status_json: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(status_json).ok()?;
    value
        .get("BackendState")
        .and_then(|s| s.as_str())
        .map(String::from)
}
