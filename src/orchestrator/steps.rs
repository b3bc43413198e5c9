//! Individual provisioning steps.
//!
//! Each step is a plain async function over [`DockerApi`] so it can be
//! exercised against the stub daemon in isolation. Sequencing, progress and
//! state transitions live in [`crate::orchestrator::provision`].

use std::time::Duration;

use bytes::Bytes;
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::archive::{ArchiveEntry, build_tar};
use crate::config::{Config, DatabaseConfig, EditorConfig};
use crate::docker::{ContainerSpec, DockerApi, ExecSpec, MANAGED_LABEL, exec_run, exec_stream};
use crate::orchestrator::error::{OrchestratorError, Result};
use crate::orchestrator::state::Sandbox;
use crate::session::Utf8Accumulator;
use crate::session::setup::{ensure_user_script, shell_quote, valid_username};
use crate::template::Variables;

/// Label Docker attaches to every container, network and volume we create.
pub const SANDBOX_LABEL: &str = "devsandbox.sandbox";

/// Deterministic Docker resource names for one sandbox.
///
/// Derivable from the sandbox id alone, so a sandbox can be torn down even
/// when its record lost the ids Docker handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub app: String,
    pub db: String,
    pub network: String,
    pub sidecar: String,
    pub sidecar_volume: String,
}

impl ResourceNames {
    pub fn new(prefix: &str, sandbox_id: Uuid) -> Self {
        let short = short_id(sandbox_id);
        let base = format!("{}-{}", prefix, short);
        Self {
            app: format!("{}-app", base),
            db: format!("{}-db", base),
            network: format!("{}-net", base),
            sidecar: format!("{}-ts", base),
            sidecar_volume: format!("{}-ts-state", base),
        }
    }
}

pub(crate) fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Primary database name for a sandbox.
pub fn database_name(sandbox_id: Uuid) -> String {
    format!("sandbox_{}", short_id(sandbox_id))
}

/// Secondary database used by the app's test suite.
pub fn test_database_name(sandbox_id: Uuid) -> String {
    format!("{}_test", database_name(sandbox_id))
}

/// Pull each image once.
pub async fn pull_images(docker: &dyn DockerApi, images: &[&str]) -> Result<()> {
    let mut seen: Vec<&str> = Vec::with_capacity(images.len());
    for image in images {
        if seen.contains(image) {
            continue;
        }
        seen.push(image);
        docker
            .pull_image(image)
            .await
            .map_err(|e| OrchestratorError::step("Pulling images", format!("{}: {}", image, e)))?;
    }
    Ok(())
}

/// Database container: the configured image on the sandbox network under
/// a stable alias, creating the sandbox's primary database on first boot.
pub fn database_spec(config: &Config, sandbox: &Sandbox, names: &ResourceNames) -> ContainerSpec {
    let db = &config.database;
    ContainerSpec::new(db.image.clone())
        .env("POSTGRES_USER", &db.user)
        .env("POSTGRES_PASSWORD", db.password.expose_secret())
        .env("POSTGRES_DB", database_name(sandbox.id))
        .env("PGPORT", db.port)
        .label(MANAGED_LABEL, "true")
        .label(SANDBOX_LABEL, sandbox.id.to_string())
        .network(&names.network, vec![db.alias.clone()])
}

/// Application container: idles on `sleep infinity` under an init process
/// so exec sessions are the only workload.
pub fn app_spec(
    config: &Config,
    sandbox: &Sandbox,
    names: &ResourceNames,
    app_port: u16,
    editor_port: u16,
) -> ContainerSpec {
    let mut spec = ContainerSpec::new(config.sandbox.app_image.clone())
        .cmd(["sleep", "infinity"])
        .env("DATABASE_URL", config.database.url_for(&database_name(sandbox.id)))
        .env(
            "TEST_DATABASE_URL",
            config.database.url_for(&test_database_name(sandbox.id)),
        )
        .env("PORT", config.sandbox.service_port)
        .label(MANAGED_LABEL, "true")
        .label(SANDBOX_LABEL, sandbox.id.to_string())
        .publish(config.sandbox.service_port, app_port)
        .publish(config.editor.port, editor_port)
        .network(&names.network, vec!["app".to_string()]);
    spec.hostname = Some(names.app.clone());
    spec.working_dir = Some(config.sandbox.workdir.clone());
    spec.host_config.init = Some(true);
    spec
}

/// Wait until the database accepts connections.
///
/// The postgres image restarts its server once after first-time
/// initialisation, so a running container is not enough: each attempt also
/// runs `pg_isready` against the real service port.
pub async fn wait_for_database(
    docker: &dyn DockerApi,
    container: &str,
    db: &DatabaseConfig,
    exec_timeout: Duration,
) -> Result<()> {
    let probe = ExecSpec::new([
        "pg_isready".to_string(),
        "-h".to_string(),
        "127.0.0.1".to_string(),
        "-p".to_string(),
        db.port.to_string(),
        "-U".to_string(),
        db.user.clone(),
    ]);

    let mut last = String::from("container not running");
    for attempt in 1..=db.ready_attempts {
        match docker.inspect_container(container).await {
            Ok(info) if info.state.running => {
                match exec_run(docker, container, &probe, exec_timeout).await {
                    Ok(out) if out.success() => {
                        tracing::debug!(container = %container, attempt, "Database ready");
                        return Ok(());
                    }
                    Ok(out) => last = format!("pg_isready exited with code {}", out.exit_code),
                    Err(e) => last = e.to_string(),
                }
            }
            Ok(_) => last = "container not running".to_string(),
            Err(e) => last = e.to_string(),
        }
        tracing::trace!(container = %container, attempt, "Database not ready: {}", last);
        if attempt < db.ready_attempts {
            tokio::time::sleep(db.ready_interval).await;
        }
    }

    Err(OrchestratorError::step(
        "Waiting for database",
        format!(
            "database not ready after {} attempts ({})",
            db.ready_attempts, last
        ),
    ))
}

/// Create a database on the sandbox's server. An existing one is kept.
pub async fn create_database(
    docker: &dyn DockerApi,
    container: &str,
    db: &DatabaseConfig,
    name: &str,
    exec_timeout: Duration,
) -> Result<()> {
    let spec = ExecSpec::new([
        "createdb".to_string(),
        "-h".to_string(),
        "127.0.0.1".to_string(),
        "-p".to_string(),
        db.port.to_string(),
        "-U".to_string(),
        db.user.clone(),
        name.to_string(),
    ])
    .env("PGPASSWORD", db.password.expose_secret());

    let out = exec_run(docker, container, &spec, exec_timeout).await?;
    let text = out.text();
    if out.success() || text.contains("already exists") {
        return Ok(());
    }
    Err(OrchestratorError::step(
        "Creating test database",
        format!("createdb exited with code {}: {}", out.exit_code, text.trim()),
    ))
}

/// Variables every script and template file can reference.
pub fn template_variables(config: &Config, sandbox: &Sandbox) -> Variables {
    let db = &config.database;
    let db_name = database_name(sandbox.id);
    let port = |p: Option<u16>| p.map(|p| p.to_string()).unwrap_or_default();

    [
        ("sandbox_id", sandbox.id.to_string()),
        ("sandbox_name", sandbox.name.clone()),
        ("user", sandbox.owner.clone()),
        ("workdir", config.sandbox.workdir.clone()),
        ("database_url", db.url_for(&db_name)),
        ("test_database_url", db.url_for(&test_database_name(sandbox.id))),
        ("db_host", db.alias.clone()),
        ("db_port", db.port.to_string()),
        ("db_user", db.user.clone()),
        ("db_password", db.password.expose_secret().to_string()),
        ("db_name", db_name),
        ("service_port", config.sandbox.service_port.to_string()),
        ("app_port", port(sandbox.app_port)),
        ("editor_port", port(sandbox.editor_port)),
        (
            "tailscale_url",
            sandbox.tailscale_url.clone().unwrap_or_default(),
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Pack `entries` and extract them under `dest`, creating it first.
pub async fn upload_entries(
    docker: &dyn DockerApi,
    container: &str,
    dest: &str,
    entries: &[ArchiveEntry],
    exec_timeout: Duration,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mkdir = ExecSpec::shell(format!("mkdir -p {}", shell_quote(dest))).user("root");
    let out = exec_run(docker, container, &mkdir, exec_timeout).await?;
    if !out.success() {
        return Err(OrchestratorError::step(
            "Uploading files",
            format!("could not create {}: {}", dest, out.text().trim()),
        ));
    }

    let archive = build_tar(entries)?;
    tracing::debug!(container = %container, dest = %dest, entries = entries.len(), bytes = archive.len(), "Uploading archive");
    docker
        .upload_archive(container, dest, Bytes::from(archive))
        .await?;
    Ok(())
}

/// The two user-supplied scripts a template carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// Runs once as root after the template files land.
    Bootstrap,
    /// Runs as the sandbox user on every provision and start.
    Startup,
}

impl ScriptKind {
    pub fn step_label(&self) -> &'static str {
        match self {
            Self::Bootstrap => "Running bootstrap script",
            Self::Startup => "Running startup script",
        }
    }

    fn noun(&self) -> &'static str {
        match self {
            Self::Bootstrap => "Bootstrap script",
            Self::Startup => "Startup script",
        }
    }
}

/// Run a rendered script under a TTY, handing complete output lines to
/// `on_line`. Fails when the script exits non-zero.
pub async fn run_script<F>(
    docker: &dyn DockerApi,
    container: &str,
    spec: &ExecSpec,
    kind: ScriptKind,
    exec_timeout: Duration,
    mut on_line: F,
) -> Result<()>
where
    F: FnMut(String) + Send,
{
    let mut decoder = Utf8Accumulator::new();
    let mut line = String::new();

    let code = exec_stream(docker, container, spec, exec_timeout, |chunk: Bytes| {
        line.push_str(&decoder.push(&chunk));
        while let Some(end) = line.find('\n') {
            let complete: String = line.drain(..=end).collect();
            let complete = complete.trim_end_matches(['\r', '\n']);
            if !complete.is_empty() {
                on_line(complete.to_string());
            }
        }
    })
    .await?;

    line.push_str(&decoder.finish());
    let rest = line.trim_end();
    if !rest.is_empty() {
        on_line(rest.to_string());
    }

    if code != 0 {
        return Err(OrchestratorError::step(
            kind.step_label(),
            format!("{} exited with code {}", kind.noun(), code),
        ));
    }
    Ok(())
}

/// Create the sandbox user and hand it the working directory.
pub async fn ensure_user(
    docker: &dyn DockerApi,
    container: &str,
    user: &str,
    uid: u32,
    workdir: &str,
    exec_timeout: Duration,
) -> Result<()> {
    if !valid_username(user) {
        return Err(OrchestratorError::step(
            "Creating user",
            format!("'{}' is not a valid user name", user),
        ));
    }

    let script = format!(
        "{}\nmkdir -p {dir} && chown -R {user}: {dir}\n",
        ensure_user_script(user, uid),
        dir = shell_quote(workdir),
        user = shell_quote(user),
    );
    let out = exec_run(docker, container, &ExecSpec::shell(script).user("root"), exec_timeout).await?;
    if !out.success() {
        return Err(OrchestratorError::step(
            "Creating user",
            format!("exited with code {}: {}", out.exit_code, out.text().trim()),
        ));
    }
    Ok(())
}

/// Install code-server unless it is already on the PATH.
pub async fn install_editor(
    docker: &dyn DockerApi,
    container: &str,
    editor: &EditorConfig,
    exec_timeout: Duration,
) -> Result<()> {
    let script = format!(
        "command -v code-server >/dev/null 2>&1 || curl -fsSL {} | sh",
        shell_quote(&editor.install_url)
    );
    let out = exec_run(docker, container, &ExecSpec::shell(script).user("root"), exec_timeout).await?;
    if !out.success() {
        return Err(OrchestratorError::step(
            "Installing editor",
            format!("installer exited with code {}: {}", out.exit_code, out.text().trim()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ExecScript, StubDocker};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_db() -> DatabaseConfig {
        DatabaseConfig {
            ready_attempts: 3,
            ready_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_resource_names_are_deterministic() {
        let id = Uuid::parse_str("3f2a9c1e-0000-4000-8000-000000000000").unwrap();
        let names = ResourceNames::new("devsandbox", id);
        assert_eq!(names.app, "devsandbox-3f2a9c1e-app");
        assert_eq!(names.db, "devsandbox-3f2a9c1e-db");
        assert_eq!(names.network, "devsandbox-3f2a9c1e-net");
        assert_eq!(names.sidecar, "devsandbox-3f2a9c1e-ts");
        assert_eq!(names.sidecar_volume, "devsandbox-3f2a9c1e-ts-state");
        assert_eq!(test_database_name(id), "sandbox_3f2a9c1e_test");
    }

    #[test]
    fn test_app_spec_publishes_both_ports() {
        let config = Config::default();
        let sandbox = Sandbox::new("demo", "dev");
        let names = ResourceNames::new("devsandbox", sandbox.id);
        let spec = app_spec(&config, &sandbox, &names, 41000, 41001);

        let app = &spec.host_config.port_bindings["4000/tcp"][0];
        assert_eq!(app.host_port, "41000");
        let editor = &spec.host_config.port_bindings["8080/tcp"][0];
        assert_eq!(editor.host_port, "41001");
        assert_eq!(spec.host_config.init, Some(true));
        assert!(spec.env.iter().any(|e| e.starts_with("DATABASE_URL=postgres://")));
    }

    #[test]
    fn test_template_variables_cover_connection_details() {
        let config = Config::default();
        let mut sandbox = Sandbox::new("demo", "dev");
        sandbox.app_port = Some(41000);
        let vars = template_variables(&config, &sandbox);
        assert_eq!(vars["user"], "dev");
        assert_eq!(vars["app_port"], "41000");
        assert_eq!(vars["editor_port"], "");
        assert_eq!(vars["db_host"], "db");
        assert!(vars["test_database_url"].ends_with("_test"));
    }

    #[tokio::test]
    async fn test_database_ready_after_probe_succeeds() {
        let docker = StubDocker::new();
        docker.start_named("db");
        docker.script_exec("pg_isready", ExecScript::output(0, "accepting connections"));
        wait_for_database(&docker, "db", &fast_db(), TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_database_readiness_gives_up() {
        let docker = StubDocker::new();
        docker.start_named("db");
        docker.script_exec("pg_isready", ExecScript::output(2, "no response"));
        let err = wait_for_database(&docker, "db", &fast_db(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready after 3 attempts"));
        let probes = docker
            .calls()
            .iter()
            .filter(|c| c.starts_with("exec:pg_isready"))
            .count();
        assert_eq!(probes, 3);
    }

    #[tokio::test]
    async fn test_create_database_tolerates_existing() {
        let docker = StubDocker::new();
        docker.script_exec(
            "createdb",
            ExecScript::output(1, "createdb: error: database \"x\" already exists"),
        );
        create_database(&docker, "db", &fast_db(), "x", TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_script_reports_lines_and_exit_code() {
        let docker = StubDocker::new();
        docker.script_exec("bootstrap", ExecScript::output(3, "one\r\ntwo\npartial"));

        let mut lines = Vec::new();
        let err = run_script(
            &docker,
            "app",
            &ExecSpec::shell("echo bootstrap"),
            ScriptKind::Bootstrap,
            TIMEOUT,
            |l| lines.push(l),
        )
        .await
        .unwrap_err();

        assert_eq!(lines, vec!["one", "two", "partial"]);
        assert!(err.to_string().contains("Bootstrap script exited with code 3"));
    }

    #[tokio::test]
    async fn test_upload_entries_creates_dest_then_uploads() {
        let docker = StubDocker::new();
        let entries = vec![ArchiveEntry::file("README.md", "hi")];
        upload_entries(&docker, "app", "/workspace", &entries, TIMEOUT)
            .await
            .unwrap();

        let uploads = docker.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].path, "/workspace");
        assert!(docker.calls().iter().any(|c| c.contains("mkdir -p '/workspace'")));
    }
}
