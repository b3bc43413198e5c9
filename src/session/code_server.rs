//! Browser IDE (code-server) sessions.
//!
//! The session is ready once code-server logs its listening banner. At that
//! point the configured extensions are installed in the background; each
//! install is independent and failures are only logged.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::docker::{DockerApi, ExecSpec, exec_run};
use crate::session::actor::{SessionKind, SessionOptions};
use crate::session::setup::shell_quote;

/// Label code-server sessions are registered under.
pub const CODE_SERVER_LABEL: &str = "code-server";

static READY_BANNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"HTTP server listening on").expect("ready banner pattern is valid")
});

/// code-server session behaviour.
#[derive(Debug, Clone)]
pub struct CodeServer {
    port: u16,
    extensions: Vec<String>,
    install_timeout: Duration,
}

impl CodeServer {
    pub fn new(port: u16, extensions: Vec<String>) -> Self {
        Self {
            port,
            extensions,
            install_timeout: Duration::from_secs(300),
        }
    }

    fn command(&self, workdir: &str) -> String {
        format!(
            "exec code-server --bind-addr 0.0.0.0:{} --auth none --disable-telemetry {}",
            self.port,
            shell_quote(workdir)
        )
    }
}

/// Command installing one extension.
pub(crate) fn install_extension_command(extension: &str) -> String {
    format!("code-server --install-extension {}", shell_quote(extension))
}

/// Install each extension in turn, logging failures.
pub async fn install_extensions(
    docker: &dyn DockerApi,
    container: &str,
    user: &str,
    extensions: &[String],
    timeout: Duration,
) -> usize {
    let mut installed = 0;
    for extension in extensions {
        let spec = ExecSpec::shell(install_extension_command(extension)).user(user.to_string());
        match exec_run(docker, container, &spec, timeout).await {
            Ok(out) if out.success() => {
                installed += 1;
                tracing::debug!(container = %container, extension = %extension, "Installed extension");
            }
            Ok(out) => tracing::warn!(
                container = %container,
                extension = %extension,
                exit_code = out.exit_code,
                "Extension install failed"
            ),
            Err(e) => tracing::warn!(
                container = %container,
                extension = %extension,
                "Extension install failed: {}",
                e
            ),
        }
    }
    installed
}

#[async_trait]
impl SessionKind for CodeServer {
    fn name(&self) -> &'static str {
        "code-server"
    }

    async fn prepare(&self, _docker: &dyn DockerApi, options: &SessionOptions) -> ExecSpec {
        let mut spec = ExecSpec::shell(self.command(&options.workdir))
            .user(options.user.clone())
            .working_dir(options.workdir.clone());
        spec.tty = true;
        spec
    }

    fn accepts_input(&self) -> bool {
        false
    }

    fn ready_pattern(&self) -> Option<&Regex> {
        Some(&*READY_BANNER)
    }

    fn on_ready(&self, docker: Arc<dyn DockerApi>, options: &SessionOptions) {
        if self.extensions.is_empty() {
            return;
        }
        let extensions = self.extensions.clone();
        let container = options.container.clone();
        let user = options.user.clone();
        let timeout = self.install_timeout;
        tokio::spawn(async move {
            let installed =
                install_extensions(docker.as_ref(), &container, &user, &extensions, timeout).await;
            tracing::info!(
                container = %container,
                installed,
                requested = extensions.len(),
                "Extension installation finished"
            );
        });
    }
}
