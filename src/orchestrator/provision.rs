//! Lifecycle operations: provision, start, stop, destroy, orphan cleanup.
//!
//! These run one at a time per sandbox; [`SandboxOrchestrator`] guarantees
//! that. Calling them directly is fine in tests and single-shot tools.
//!
//! [`SandboxOrchestrator`]: crate::orchestrator::SandboxOrchestrator

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::archive::flatten_tree;
use crate::config::Config;
use crate::docker::{DockerApi, ExecSpec, exec_run, ignore_not_found};
use crate::orchestrator::error::{OrchestratorError, Result};
use crate::orchestrator::ports::allocate_ports;
use crate::orchestrator::progress::{LogProgress, ProgressSink, ProvisioningStep, StepOutcome, topic};
use crate::orchestrator::source::{
    FileSource, NoFiles, SandboxTemplate, StaticTemplateSource, TemplateSource,
};
use crate::orchestrator::state::{Sandbox, SandboxEvent};
use crate::orchestrator::steps::{
    self, ResourceNames, ScriptKind, app_spec, database_spec, test_database_name,
};
use crate::orchestrator::store::SandboxStore;
use crate::session::code_server::install_extensions;
use crate::session::teardown::KILL_ALL_BUT_INIT;
use crate::sidecar::manager::{remove_sidecar, stop_sidecar};
use crate::sidecar::{SidecarRequest, TailscaleManager};
use crate::template::{MustacheRenderer, TemplateRenderer, Variables};

/// Runs lifecycle operations against Docker and records the results.
pub struct Provisioner {
    docker: Arc<dyn DockerApi>,
    store: Arc<dyn SandboxStore>,
    progress: Arc<dyn ProgressSink>,
    renderer: Arc<dyn TemplateRenderer>,
    templates: Arc<dyn TemplateSource>,
    files: Arc<dyn FileSource>,
    sidecars: Option<TailscaleManager>,
    config: Config,
}

impl Provisioner {
    /// Create a provisioner with an empty template, no uploaded files and
    /// log-only progress. The sidecar manager is enabled from
    /// `config.sidecar`.
    pub fn new(docker: Arc<dyn DockerApi>, store: Arc<dyn SandboxStore>, config: Config) -> Self {
        let sidecars = config
            .sidecar
            .to_tailscale_config()
            .map(|ts| TailscaleManager::new(docker.clone(), ts));

        Self {
            docker,
            store,
            progress: Arc::new(LogProgress),
            renderer: Arc::new(MustacheRenderer),
            templates: Arc::new(StaticTemplateSource::new(SandboxTemplate::default())),
            files: Arc::new(NoFiles),
            sidecars,
            config,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateSource>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_files(mut self, files: Arc<dyn FileSource>) -> Self {
        self.files = files;
        self
    }

    pub fn with_sidecars(mut self, sidecars: Option<TailscaleManager>) -> Self {
        self.sidecars = sidecars;
        self
    }

    pub fn docker(&self) -> &Arc<dyn DockerApi> {
        &self.docker
    }

    pub fn store(&self) -> &Arc<dyn SandboxStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Docker resource names for a sandbox.
    pub fn names(&self, sandbox_id: Uuid) -> ResourceNames {
        ResourceNames::new(&self.config.sandbox.name_prefix, sandbox_id)
    }

    fn exec_timeout(&self) -> Duration {
        self.config.docker.exec_timeout
    }

    fn stop_secs(&self) -> u64 {
        self.config.sandbox.stop_timeout.as_secs()
    }

    fn publish(&self, sandbox_id: Uuid, label: &str, outcome: StepOutcome) {
        self.progress.publish(
            &topic(sandbox_id),
            ProvisioningStep::new(sandbox_id, label, outcome),
        );
    }

    /// Announce `label`, run it, announce how it ended.
    async fn step<T, F>(&self, sandbox_id: Uuid, label: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tracing::info!(sandbox_id = %sandbox_id, "{}", label);
        self.publish(sandbox_id, label, StepOutcome::Started);
        match fut.await {
            Ok(value) => {
                self.publish(sandbox_id, label, StepOutcome::Succeeded);
                Ok(value)
            }
            Err(e) => {
                self.publish(sandbox_id, label, StepOutcome::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Log and announce a best-effort step that did not complete.
    fn skipped(&self, sandbox_id: Uuid, label: &str, reason: impl ToString) {
        let reason = reason.to_string();
        tracing::warn!(sandbox_id = %sandbox_id, "{} failed: {}", label, reason);
        self.publish(sandbox_id, label, StepOutcome::Skipped(reason));
    }

    async fn persist(&self, sandbox: &Sandbox) -> Result<()> {
        self.store.update(sandbox).await?;
        Ok(())
    }

    /// Record a failed operation: move to `error` with the message and
    /// announce it.
    async fn fail(&self, sandbox: &mut Sandbox, error: &OrchestratorError) {
        let message = error.to_string();
        tracing::error!(sandbox_id = %sandbox.id, "Sandbox operation failed: {}", message);

        if let Err(e) = sandbox.apply(SandboxEvent::Fail(message.clone())) {
            tracing::warn!(sandbox_id = %sandbox.id, "Could not record failure: {}", e);
            return;
        }
        if let Err(e) = self.store.update(sandbox).await {
            tracing::error!(sandbox_id = %sandbox.id, "Failed to persist error state: {}", e);
        }
        self.publish(sandbox.id, "Sandbox failed", StepOutcome::Failed(message));
    }

    /// Check `event` is legal before doing any Docker work for it.
    fn require(&self, sandbox: &Sandbox, event: &SandboxEvent) -> Result<()> {
        if event.target(sandbox.state()).is_none() {
            return Err(crate::orchestrator::TransitionError {
                sandbox_id: sandbox.id,
                from: sandbox.state(),
                event: event.name(),
            }
            .into());
        }
        Ok(())
    }

    /// Build a fresh sandbox: `creating → provisioning → running`, or
    /// `error` with the failing step's message.
    pub async fn provision(&self, sandbox_id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.store.load(sandbox_id).await?;
        sandbox.apply(SandboxEvent::BeginProvisioning)?;
        self.persist(&sandbox).await?;
        tracing::info!(sandbox_id = %sandbox.id, name = %sandbox.name, "Provisioning sandbox");

        match self.run_provisioning(&mut sandbox).await {
            Ok(()) => {
                sandbox.apply(SandboxEvent::ProvisioningSucceeded)?;
                self.persist(&sandbox).await?;
                self.publish(sandbox.id, "Sandbox ready", StepOutcome::Succeeded);
                tracing::info!(sandbox_id = %sandbox.id, "Sandbox running");
                Ok(sandbox)
            }
            Err(e) => {
                self.fail(&mut sandbox, &e).await;
                Err(e)
            }
        }
    }

    async fn run_provisioning(&self, sandbox: &mut Sandbox) -> Result<()> {
        let id = sandbox.id;
        let names = self.names(id);
        let docker = self.docker.as_ref();
        let timeout = self.exec_timeout();

        let ports = self
            .step(id, "Allocating ports", async {
                allocate_ports(2).map_err(|e| OrchestratorError::step("Allocating ports", e))
            })
            .await?;
        sandbox.app_port = Some(ports[0]);
        sandbox.editor_port = Some(ports[1]);
        self.persist(sandbox).await?;

        let images = [
            self.config.database.image.as_str(),
            self.config.sandbox.app_image.as_str(),
        ];
        self.step(id, "Pulling images", steps::pull_images(docker, &images))
            .await?;

        let network_id = self
            .step(id, "Creating network", async {
                docker
                    .create_network(&names.network)
                    .await
                    .map_err(OrchestratorError::from)
            })
            .await?;
        sandbox.network_id = Some(network_id);
        self.persist(sandbox).await?;

        let db_spec = database_spec(&self.config, sandbox, &names);
        let db_id = self
            .step(id, "Starting database", async {
                self.replace_container(&names.db, &db_spec).await
            })
            .await?;
        sandbox.db_container_id = Some(db_id.clone());
        self.persist(sandbox).await?;

        self.step(
            id,
            "Waiting for database",
            steps::wait_for_database(docker, &db_id, &self.config.database, timeout),
        )
        .await?;

        let test_db = test_database_name(id);
        self.step(
            id,
            "Creating test database",
            steps::create_database(docker, &db_id, &self.config.database, &test_db, timeout),
        )
        .await?;

        let spec = app_spec(&self.config, sandbox, &names, ports[0], ports[1]);
        let app_id = self
            .step(id, "Starting app container", async {
                self.replace_container(&names.app, &spec).await
            })
            .await?;
        sandbox.app_container_id = Some(app_id.clone());
        self.persist(sandbox).await?;

        self.create_sidecar(sandbox, &names, &app_id).await;
        self.persist(sandbox).await?;

        let template = self.templates.template_for(sandbox).await?;
        let variables = steps::template_variables(&self.config, sandbox);

        self.step(id, "Uploading template files", async {
            let entries = flatten_tree(&template.files, self.renderer.as_ref(), &variables)
                .map_err(OrchestratorError::from)?;
            steps::upload_entries(docker, &app_id, &self.config.sandbox.workdir, &entries, timeout)
                .await
        })
        .await?;

        if let Some(script) = &template.bootstrap_script {
            self.run_template_script(sandbox, &app_id, script, &variables, ScriptKind::Bootstrap)
                .await?;
        }

        self.step(
            id,
            "Creating user",
            steps::ensure_user(
                docker,
                &app_id,
                &sandbox.owner,
                self.config.sandbox.user_uid,
                &self.config.sandbox.workdir,
                timeout,
            ),
        )
        .await?;

        self.step(
            id,
            "Installing editor",
            steps::install_editor(docker, &app_id, &self.config.editor, timeout),
        )
        .await?;
        self.install_editor_extensions(sandbox, &app_id).await;

        if let Some(script) = &template.startup_script {
            self.run_template_script(sandbox, &app_id, script, &variables, ScriptKind::Startup)
                .await?;
        }

        self.sync_files(sandbox, &app_id).await;
        Ok(())
    }

    /// Create and start a container, removing any stale one holding the name.
    async fn replace_container(
        &self,
        name: &str,
        spec: &crate::docker::ContainerSpec,
    ) -> Result<String> {
        ignore_not_found(self.docker.remove_container(name, true).await)?;
        let id = self.docker.create_container(name, spec).await?;
        self.docker.start_container(&id).await?;
        Ok(id)
    }

    async fn create_sidecar(&self, sandbox: &mut Sandbox, names: &ResourceNames, app_id: &str) {
        let Some(manager) = &self.sidecars else {
            return;
        };
        let label = "Creating Tailscale sidecar";
        self.publish(sandbox.id, label, StepOutcome::Started);

        let request = SidecarRequest {
            container_name: names.sidecar.clone(),
            volume_name: names.sidecar_volume.clone(),
            app_container_id: app_id.to_string(),
            sandbox_short_id: sandbox.short_id(),
            serve_port: self.config.sandbox.service_port,
        };
        match manager.create(&request).await {
            Ok(sidecar) => {
                sandbox.sidecar_container_id = Some(sidecar.container_id);
                sandbox.tailscale_url = sidecar.endpoint.https_url();
                sandbox.tailscale_hostname = Some(sidecar.endpoint.hostname);
                self.publish(sandbox.id, label, StepOutcome::Succeeded);
            }
            Err(e) => self.skipped(sandbox.id, label, e),
        }
    }

    async fn run_template_script(
        &self,
        sandbox: &Sandbox,
        container: &str,
        script: &str,
        variables: &Variables,
        kind: ScriptKind,
    ) -> Result<()> {
        let id = sandbox.id;
        let label = kind.step_label();
        self.step(id, label, async {
            let rendered = self
                .renderer
                .render(script, variables)
                .map_err(OrchestratorError::from)?;
            let spec = match kind {
                ScriptKind::Bootstrap => ExecSpec::shell(rendered).user("root"),
                ScriptKind::Startup => ExecSpec::shell(rendered).user(sandbox.owner.clone()),
            }
            .working_dir(self.config.sandbox.workdir.clone());

            steps::run_script(
                self.docker.as_ref(),
                container,
                &spec,
                kind,
                self.exec_timeout(),
                |line| self.publish(id, label, StepOutcome::Output(line)),
            )
            .await
        })
        .await
    }

    async fn install_editor_extensions(&self, sandbox: &Sandbox, container: &str) {
        let extensions = &self.config.editor.extensions;
        if extensions.is_empty() {
            return;
        }
        let installed = install_extensions(
            self.docker.as_ref(),
            container,
            &sandbox.owner,
            extensions,
            self.exec_timeout(),
        )
        .await;
        if installed < extensions.len() {
            self.skipped(
                sandbox.id,
                "Installing editor extensions",
                format!("{} of {} installed", installed, extensions.len()),
            );
        }
    }

    /// Best-effort upload of previously uploaded project files.
    async fn sync_files(&self, sandbox: &Sandbox, container: &str) {
        let label = "Syncing project files";
        let result = async {
            let entries = self.files.files_for(sandbox.id).await?;
            if entries.is_empty() {
                return Ok(0);
            }
            steps::upload_entries(
                self.docker.as_ref(),
                container,
                &self.config.sandbox.workdir,
                &entries,
                self.exec_timeout(),
            )
            .await?;
            Ok::<_, OrchestratorError>(entries.len())
        }
        .await;

        match result {
            Ok(0) => {}
            Ok(count) => {
                tracing::info!(sandbox_id = %sandbox.id, files = count, "Synced project files");
                self.publish(sandbox.id, label, StepOutcome::Succeeded);
            }
            Err(e) => self.skipped(sandbox.id, label, e),
        }
    }

    /// `stopped → running`: restart containers, re-run the idempotent
    /// setup and startup script, resync files.
    pub async fn start(&self, sandbox_id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.store.load(sandbox_id).await?;
        self.require(&sandbox, &SandboxEvent::Start)?;

        match self.run_start(&mut sandbox).await {
            Ok(()) => {
                sandbox.apply(SandboxEvent::Start)?;
                self.persist(&sandbox).await?;
                tracing::info!(sandbox_id = %sandbox.id, "Sandbox started");
                Ok(sandbox)
            }
            Err(e) => {
                self.fail(&mut sandbox, &e).await;
                Err(e)
            }
        }
    }

    async fn run_start(&self, sandbox: &mut Sandbox) -> Result<()> {
        let id = sandbox.id;
        let names = self.names(id);
        let docker = self.docker.as_ref();
        let timeout = self.exec_timeout();

        let db = sandbox.db_container_id.clone().unwrap_or(names.db);
        let app = sandbox.app_container_id.clone().unwrap_or(names.app);

        self.step(id, "Starting database", async {
            docker.start_container(&db).await.map_err(OrchestratorError::from)
        })
        .await?;
        self.step(
            id,
            "Waiting for database",
            steps::wait_for_database(docker, &db, &self.config.database, timeout),
        )
        .await?;
        self.step(id, "Starting app container", async {
            docker.start_container(&app).await.map_err(OrchestratorError::from)
        })
        .await?;

        if let (Some(manager), Some(sidecar)) = (&self.sidecars, &sandbox.sidecar_container_id)
            && let Err(e) = manager.start(sidecar).await
        {
            self.skipped(id, "Starting Tailscale sidecar", e);
        }

        self.step(
            id,
            "Creating user",
            steps::ensure_user(
                docker,
                &app,
                &sandbox.owner,
                self.config.sandbox.user_uid,
                &self.config.sandbox.workdir,
                timeout,
            ),
        )
        .await?;

        let template = self.templates.template_for(sandbox).await?;
        if let Some(script) = &template.startup_script {
            let variables = steps::template_variables(&self.config, sandbox);
            self.run_template_script(sandbox, &app, script, &variables, ScriptKind::Startup)
                .await?;
        }

        self.sync_files(sandbox, &app).await;
        Ok(())
    }

    /// `running → stopped`: sidecar first, then app, then database.
    pub async fn stop(&self, sandbox_id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.store.load(sandbox_id).await?;
        self.require(&sandbox, &SandboxEvent::Stop)?;

        match self.run_stop(&sandbox).await {
            Ok(()) => {
                sandbox.apply(SandboxEvent::Stop)?;
                self.persist(&sandbox).await?;
                tracing::info!(sandbox_id = %sandbox.id, "Sandbox stopped");
                Ok(sandbox)
            }
            Err(e) => {
                self.fail(&mut sandbox, &e).await;
                Err(e)
            }
        }
    }

    async fn run_stop(&self, sandbox: &Sandbox) -> Result<()> {
        let names = self.names(sandbox.id);
        let secs = self.stop_secs();

        if let Some(sidecar) = &sandbox.sidecar_container_id {
            let stopped = match &self.sidecars {
                Some(manager) => manager.stop(sidecar, secs).await,
                None => stop_sidecar(self.docker.as_ref(), sidecar, secs).await,
            };
            if let Err(e) = stopped {
                self.skipped(sandbox.id, "Stopping Tailscale sidecar", e);
            }
        }

        let app = sandbox.app_container_id.clone().unwrap_or(names.app);
        let db = sandbox.db_container_id.clone().unwrap_or(names.db);
        self.step(sandbox.id, "Stopping app container", async {
            ignore_not_found(self.docker.stop_container(&app, secs).await)
                .map_err(OrchestratorError::from)
        })
        .await?;
        self.step(sandbox.id, "Stopping database", async {
            ignore_not_found(self.docker.stop_container(&db, secs).await)
                .map_err(OrchestratorError::from)
        })
        .await?;
        Ok(())
    }

    /// Tear everything down. Always ends in `destroyed` once it has
    /// started; individual removal failures are logged.
    pub async fn destroy(&self, sandbox_id: Uuid) -> Result<Sandbox> {
        let mut sandbox = self.store.load(sandbox_id).await?;
        sandbox.apply(SandboxEvent::BeginDestroy)?;
        self.persist(&sandbox).await?;
        tracing::info!(sandbox_id = %sandbox.id, "Destroying sandbox");

        self.remove_resources(&sandbox).await;

        sandbox.apply(SandboxEvent::Destroyed)?;
        self.persist(&sandbox).await?;
        self.publish(sandbox.id, "Sandbox destroyed", StepOutcome::Succeeded);
        Ok(sandbox)
    }

    async fn remove_resources(&self, sandbox: &Sandbox) {
        let names = self.names(sandbox.id);
        let id = sandbox.id;

        let sidecar = sandbox
            .sidecar_container_id
            .clone()
            .unwrap_or_else(|| names.sidecar.clone());
        self.remove_step(id, "Removing Tailscale sidecar", async {
            match &self.sidecars {
                Some(manager) => manager.destroy(&sidecar, &names.sidecar_volume).await,
                None => remove_sidecar(self.docker.as_ref(), &sidecar, &names.sidecar_volume).await,
            }
        })
        .await;

        let app = sandbox.app_container_id.clone().unwrap_or_else(|| names.app.clone());
        self.remove_step(id, "Removing app container", async {
            ignore_not_found(self.docker.remove_container(&app, true).await)
        })
        .await;

        let db = sandbox.db_container_id.clone().unwrap_or_else(|| names.db.clone());
        self.remove_step(id, "Removing database", async {
            ignore_not_found(self.docker.remove_container(&db, true).await)
        })
        .await;

        let network = sandbox
            .network_id
            .clone()
            .unwrap_or_else(|| names.network.clone());
        self.remove_step(id, "Removing network", async {
            ignore_not_found(self.docker.remove_network(&network).await)
        })
        .await;
    }

    async fn remove_step<F, E>(&self, sandbox_id: Uuid, label: &'static str, fut: F)
    where
        F: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        self.publish(sandbox_id, label, StepOutcome::Started);
        match fut.await {
            Ok(()) => self.publish(sandbox_id, label, StepOutcome::Succeeded),
            Err(e) => self.skipped(sandbox_id, label, e),
        }
    }

    /// Remove every resource derivable from `sandbox_id` without touching
    /// the store. For records that were lost or never written.
    pub async fn purge(&self, sandbox_id: Uuid) {
        let mut placeholder = Sandbox::new("purged", "root");
        placeholder.id = sandbox_id;
        self.remove_resources(&placeholder).await;
    }

    /// Signal every non-init process in each running sandbox's app
    /// container. Reaps exec sessions left behind by a crashed controller.
    ///
    /// Returns how many containers were signalled.
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let running = self
            .store
            .list_by_state(crate::orchestrator::SandboxState::Running)
            .await?;

        let spec = ExecSpec::shell(KILL_ALL_BUT_INIT).user("root");
        let mut cleaned = 0;
        for sandbox in running {
            let Some(container) = &sandbox.app_container_id else {
                continue;
            };
            match exec_run(self.docker.as_ref(), container, &spec, self.config.docker.request_timeout)
                .await
            {
                Ok(_) => {
                    cleaned += 1;
                    tracing::info!(sandbox_id = %sandbox.id, container = %container, "Cleaned up orphaned processes");
                }
                Err(e) => tracing::warn!(
                    sandbox_id = %sandbox.id,
                    container = %container,
                    "Orphan cleanup failed: {}",
                    e
                ),
            }
        }
        Ok(cleaned)
    }
}
