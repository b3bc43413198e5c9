//! Process-tree termination inside a container.

use std::time::Duration;

use crate::docker::{DockerApi, DockerError, ExecSpec, exec_run};

/// Signal the process group led by `pid`, falling back to the single process.
///
/// Closing an exec socket only hangs up the shell; children it started
/// (dev servers, watchers, `tail -f`) keep running. Signalling the negated
/// pid reaches the whole group. Pids 0 and 1 are refused so a bad inspect
/// result can never take down the container's init.
pub async fn terminate_process_tree(
    docker: &dyn DockerApi,
    container: &str,
    pid: i64,
    timeout: Duration,
) -> Result<(), DockerError> {
    if pid <= 1 {
        tracing::debug!(container = %container, pid, "No process tree to terminate");
        return Ok(());
    }

    let spec = ExecSpec::shell(kill_script(pid)).user("root");
    let output = exec_run(docker, container, &spec, timeout).await?;
    tracing::debug!(
        container = %container,
        pid,
        exit_code = output.exit_code,
        "Signalled process tree"
    );
    Ok(())
}

pub(crate) fn kill_script(pid: i64) -> String {
    format!(
        "kill -TERM -- -{pid} 2>/dev/null || kill -TERM {pid} 2>/dev/null || true",
        pid = pid
    )
}

/// Signal every process except init. Used to reap sessions orphaned by a
/// crashed controller.
pub(crate) const KILL_ALL_BUT_INIT: &str = "kill -TERM -1 2>/dev/null || true";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubDocker;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_kill_script_targets_negated_pid() {
        let script = kill_script(4242);
        assert!(script.starts_with("kill -TERM -- -4242"));
        assert!(script.contains("kill -TERM 4242"));
    }

    #[tokio::test]
    async fn test_runs_kill_as_root() {
        let docker = StubDocker::new();
        terminate_process_tree(&docker, "app", 812, TIMEOUT)
            .await
            .unwrap();

        let specs = docker.exec_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].user.as_deref(), Some("root"));
        assert!(specs[0].cmd[2].contains("-812"));
    }

    #[tokio::test]
    async fn test_refuses_init_and_unknown_pids() {
        let docker = StubDocker::new();
        terminate_process_tree(&docker, "app", 1, TIMEOUT).await.unwrap();
        terminate_process_tree(&docker, "app", 0, TIMEOUT).await.unwrap();
        assert!(docker.exec_specs().is_empty());
    }
}
