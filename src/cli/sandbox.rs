//! Sandbox lifecycle commands and one-off exec.
//!
//! Records are kept in a JSON file (`--state`) so separate invocations see
//! the same sandboxes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::docker::{DockerApi, DockerClient, ExecSpec, exec_run};
use crate::error::StoreError;
use crate::orchestrator::{
    BroadcastProgress, DirectoryTemplateSource, JsonFileSandboxStore, OrchestratorError,
    Provisioner, Sandbox, SandboxOrchestrator, SandboxState, SandboxStore, StepOutcome,
};

fn store_for(state: &Path) -> anyhow::Result<Arc<JsonFileSandboxStore>> {
    if let Some(dir) = state.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(Arc::new(JsonFileSandboxStore::new(state)))
}

fn orchestrator(config: Config, state: &Path) -> anyhow::Result<SandboxOrchestrator> {
    let docker: Arc<dyn DockerApi> = Arc::new(DockerClient::new(config.docker.clone()));
    let provisioner = Provisioner::new(docker, store_for(state)?, config);
    Ok(SandboxOrchestrator::new(provisioner))
}

fn print_sandbox(sandbox: &Sandbox) {
    println!("Sandbox:  {} ({})", sandbox.name, sandbox.id);
    println!("State:    {}", sandbox.state());
    if let Some(container) = &sandbox.app_container_id {
        println!("App:      {}", container);
    }
    if let Some(port) = sandbox.app_port {
        println!("App port: 127.0.0.1:{}", port);
    }
    if let Some(port) = sandbox.editor_port {
        println!("Editor:   http://127.0.0.1:{}", port);
    }
    if let Some(url) = &sandbox.tailscale_url {
        println!("Tailnet:  {}", url);
    }
    if let Some(error) = &sandbox.last_error {
        println!("Error:    {}", error);
    }
}

pub async fn run_exec_command(
    config: &Config,
    container: &str,
    user: Option<&str>,
    cmd: Vec<String>,
) -> anyhow::Result<()> {
    let client = DockerClient::new(config.docker.clone());
    let mut spec = ExecSpec::new(cmd);
    if let Some(user) = user {
        spec = spec.user(user);
    }

    let output = exec_run(&client, container, &spec, config.docker.exec_timeout).await?;
    print!("{}", output.text());
    if !output.success() {
        anyhow::bail!("command exited with code {}", output.exit_code);
    }
    Ok(())
}

pub async fn run_provision_command(
    config: Config,
    state: &Path,
    id: Option<Uuid>,
    name: &str,
    owner: &str,
    template_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let docker: Arc<dyn DockerApi> = Arc::new(DockerClient::new(config.docker.clone()));
    let progress = Arc::new(BroadcastProgress::default());
    let mut provisioner =
        Provisioner::new(docker, store_for(state)?, config).with_progress(progress.clone());
    if let Some(dir) = template_dir {
        provisioner = provisioner.with_templates(Arc::new(DirectoryTemplateSource::new(dir)));
    }
    let orchestrator = SandboxOrchestrator::new(provisioner);

    let sandbox_id = match id {
        Some(id) => orchestrator.get(id).await?.id,
        None => orchestrator.create(name, owner).await?.id,
    };
    println!("Provisioning sandbox {}", sandbox_id);

    let mut rx = progress.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok((_, step)) = rx.recv().await {
            match &step.outcome {
                StepOutcome::Output(line) => println!("  | {}", line),
                _ => println!("{}", step.message()),
            }
        }
    });

    let result = orchestrator.provision(sandbox_id).await;
    printer.abort();

    match result {
        Ok(sandbox) => {
            print_sandbox(&sandbox);
            Ok(())
        }
        Err(e) => {
            if let Ok(sandbox) = orchestrator.get(sandbox_id).await {
                print_sandbox(&sandbox);
            }
            Err(e.into())
        }
    }
}

pub async fn run_destroy_command(config: Config, state: &Path, id: Uuid) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, state)?;
    match orchestrator.destroy(id).await {
        Ok(sandbox) => {
            print_sandbox(&sandbox);
            Ok(())
        }
        Err(
            OrchestratorError::NotFound(_) | OrchestratorError::Store(StoreError::NotFound(_)),
        ) => {
            // No record; fall back to the names derived from the id.
            orchestrator.provisioner().purge(id).await;
            println!("Removed resources for unrecorded sandbox {}", id);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn run_cleanup_command(config: Config, state: &Path) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config, state)?;
    let cleaned = orchestrator.cleanup_orphans().await?;
    println!("Cleaned up {} sandbox(es)", cleaned);
    Ok(())
}

pub async fn run_list_command(state: &Path) -> anyhow::Result<()> {
    let store = JsonFileSandboxStore::new(state);
    let mut sandboxes = Vec::new();
    for wanted in SandboxState::ALL {
        sandboxes.extend(store.list_by_state(wanted).await?);
    }
    sandboxes.sort_by_key(|s| s.created_at);

    if sandboxes.is_empty() {
        println!("No sandboxes recorded in {}", state.display());
        return Ok(());
    }
    for sandbox in &sandboxes {
        println!(
            "{}  {:<12}  {:<20}  {}",
            sandbox.id,
            sandbox.state().to_string(),
            sandbox.name,
            sandbox.app_container_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_reads_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/sandboxes.json");
        let store = store_for(&path).unwrap();
        store.update(&Sandbox::new("demo", "dev")).await.unwrap();

        run_list_command(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_with_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        run_list_command(&dir.path().join("absent.json")).await.unwrap();
    }
}
