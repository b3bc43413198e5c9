//! Output-only dev server sessions. One per sandbox.

use async_trait::async_trait;

use crate::docker::{DockerApi, ExecSpec};
use crate::session::actor::{SessionKind, SessionOptions};

/// Label every dev server session is registered under.
pub const DEV_SERVER_LABEL: &str = "dev-server";

/// Runs the sandbox's dev server command under a TTY so it colours its
/// output, without attaching stdin.
#[derive(Debug, Clone)]
pub struct DevServer {
    command: String,
}

impl DevServer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl SessionKind for DevServer {
    fn name(&self) -> &'static str {
        "dev-server"
    }

    async fn prepare(&self, _docker: &dyn DockerApi, options: &SessionOptions) -> ExecSpec {
        let mut spec = ExecSpec::shell(format!("exec {}", self.command))
            .user(options.user.clone())
            .working_dir(options.workdir.clone())
            .env("TERM", "xterm-256color");
        spec.tty = true;
        spec
    }

    fn accepts_input(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::session::actor::{SessionError, start_session};
    use crate::testing::StubDocker;

    #[tokio::test]
    async fn test_rejects_input() {
        let docker = Arc::new(StubDocker::new());
        let (sink, _events) = mpsc::channel(8);
        let options = SessionOptions::new(Uuid::new_v4(), "app", DEV_SERVER_LABEL);
        let handle = start_session(
            docker.clone(),
            Arc::new(DevServer::new("mix phx.server")),
            options,
            sink,
        );

        let err = handle.send_input("q").await.unwrap_err();
        assert!(matches!(err, SessionError::InputNotSupported(_)));

        let specs = docker.wait_exec_specs(1).await;
        assert!(specs[0].tty);
        assert!(!specs[0].attach_stdin);
        assert_eq!(specs[0].cmd[2], "exec mix phx.server");
        handle.stop().await;
    }
}
