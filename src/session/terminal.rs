//! Interactive terminal sessions.
//!
//! When tmux is available the shell runs inside `tmux new-session -A -s
//! <label>`, so a UI client reconnecting with the same label re-attaches to
//! the same shell state. Otherwise a bare login shell is started.

use async_trait::async_trait;

use crate::docker::{DockerApi, ExecSpec};
use crate::session::actor::{SessionKind, SessionOptions};
use crate::session::setup::{SetupPlan, run_setup, shell_quote};

const BARE_SHELL: &str = "if command -v bash >/dev/null 2>&1; then exec bash -l; else exec sh -l; fi";

/// Terminal session behaviour.
#[derive(Debug, Clone)]
pub struct Terminal {
    setup: SetupPlan,
}

impl Terminal {
    pub fn new(setup: SetupPlan) -> Self {
        let mut setup = setup;
        setup.ensure_tmux = true;
        Self { setup }
    }
}

/// tmux rejects `.` and `:` in session names; keep labels boring.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "main".to_string()
    } else {
        cleaned
    }
}

fn terminal_command(label: &str, tmux_available: bool) -> String {
    if tmux_available {
        format!(
            "exec tmux new-session -A -s {}",
            shell_quote(&sanitize_label(label))
        )
    } else {
        BARE_SHELL.to_string()
    }
}

#[async_trait]
impl SessionKind for Terminal {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn prepare(&self, docker: &dyn DockerApi, options: &SessionOptions) -> ExecSpec {
        let outcome = run_setup(docker, &options.container, &self.setup).await;
        if !outcome.tmux_available {
            tracing::info!(
                sandbox_id = %options.sandbox_id,
                "tmux unavailable, falling back to a bare shell"
            );
        }

        ExecSpec::shell(terminal_command(&options.label, outcome.tmux_available))
            .user(options.user.clone())
            .working_dir(options.workdir.clone())
            .env("TERM", "xterm-256color")
            .env("LANG", "C.UTF-8")
            .interactive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ExecScript, StubDocker};
    use uuid::Uuid;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("main"), "main");
        assert_eq!(sanitize_label("feature.x:1"), "feature_x_1");
        assert_eq!(sanitize_label(""), "main");
    }

    #[tokio::test]
    async fn test_uses_tmux_when_available() {
        let docker = StubDocker::new();
        let options = SessionOptions::new(Uuid::new_v4(), "app", "work").user("dev");
        let spec = Terminal::new(SetupPlan::new("dev", 1000))
            .prepare(&docker, &options)
            .await;

        assert!(spec.tty);
        assert_eq!(spec.cmd[2], "exec tmux new-session -A -s 'work'");
        assert_eq!(spec.user.as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn test_falls_back_without_tmux() {
        let docker = StubDocker::new();
        docker.script_exec("command -v tmux", ExecScript::output(1, ""));
        let options = SessionOptions::new(Uuid::new_v4(), "app", "work");
        let spec = Terminal::new(SetupPlan::new("dev", 1000))
            .prepare(&docker, &options)
            .await;

        assert_eq!(spec.cmd[2], BARE_SHELL);
        assert!(spec.attach_stdin);
    }
}
