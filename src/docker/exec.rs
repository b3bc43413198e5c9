//! One-shot exec helpers composed from [`DockerApi`] primitives.
//!
//! `exec_run` captures demultiplexed output of a non-TTY command;
//! `exec_stream` forwards TTY output chunk by chunk. Both return once the
//! remote process has exited and the daemon has closed the connection.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use crate::docker::api::DockerApi;
use crate::docker::error::{DockerError, Result};
use crate::docker::frame;
use crate::docker::types::{ExecOutput, ExecSpec};
use crate::docker::upgrade::{self, ExecConnection};

/// How many times to re-inspect an exec whose exit code is not yet recorded.
const EXIT_CODE_POLLS: u32 = 20;
const EXIT_CODE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run a command to completion and capture its output.
///
/// The command runs without a TTY, so the daemon frames stdout and stderr;
/// payloads are concatenated in arrival order regardless of stream.
pub async fn exec_run(
    docker: &dyn DockerApi,
    container: &str,
    spec: &ExecSpec,
    timeout: Duration,
) -> Result<ExecOutput> {
    let mut spec = spec.clone();
    spec.tty = false;
    spec.attach_stdin = false;

    let run = async {
        let exec_id = docker.create_exec(container, &spec).await?;
        tracing::debug!(container = %container, exec_id = %exec_id, cmd = ?spec.cmd, "Running exec");

        let ExecConnection {
            mut stream,
            first_chunk,
        } = docker.start_exec_stream(&exec_id, false).await?;

        let mut raw = first_chunk.to_vec();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| DockerError::transport("exec run", e))?;

        let output = frame::demux(&raw);
        let exit_code = wait_exit_code(docker, &exec_id).await?;
        Ok(ExecOutput { exit_code, output })
    };

    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| DockerError::Timeout {
            operation: "exec run".to_string(),
            timeout,
        })?
}

/// Run a command under a TTY, handing every output chunk to `on_chunk`.
///
/// Returns the exit code after the stream closes.
pub async fn exec_stream<F>(
    docker: &dyn DockerApi,
    container: &str,
    spec: &ExecSpec,
    timeout: Duration,
    on_chunk: F,
) -> Result<i64>
where
    F: FnMut(Bytes) + Send,
{
    let mut spec = spec.clone();
    spec.tty = true;

    let run = async {
        let exec_id = docker.create_exec(container, &spec).await?;
        tracing::debug!(container = %container, exec_id = %exec_id, cmd = ?spec.cmd, "Streaming exec");

        let (reader, _writer, first_chunk) =
            docker.start_exec_stream(&exec_id, true).await?.into_split();
        upgrade::receive_loop(reader, first_chunk, on_chunk).await?;

        wait_exit_code(docker, &exec_id).await
    };

    tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| DockerError::Timeout {
            operation: "exec stream".to_string(),
            timeout,
        })?
}

/// The daemon can report the stream closed a moment before it records the
/// exit code, so poll briefly.
async fn wait_exit_code(docker: &dyn DockerApi, exec_id: &str) -> Result<i64> {
    for _ in 0..EXIT_CODE_POLLS {
        let inspect = docker.inspect_exec(exec_id).await?;
        if !inspect.running
            && let Some(code) = inspect.exit_code
        {
            return Ok(code);
        }
        tokio::time::sleep(EXIT_CODE_POLL_INTERVAL).await;
    }
    Err(DockerError::protocol(
        "inspect exec",
        format!("exec {} never reported an exit code", exec_id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ExecScript, StubDocker};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_exec_run_demuxes_output_and_reports_code() {
        let docker = StubDocker::new();
        docker.script_exec("cat /etc/hostname", ExecScript::output(0, "sandbox\n"));
        docker.script_exec("false", ExecScript::output(1, ""));

        let out = exec_run(&docker, "app", &ExecSpec::shell("cat /etc/hostname"), TIMEOUT)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.text(), "sandbox\n");

        let failed = exec_run(&docker, "app", &ExecSpec::shell("false"), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(failed.exit_code, 1);
    }

    #[tokio::test]
    async fn test_exec_run_forces_non_tty() {
        let docker = StubDocker::new();
        docker.script_exec("ls", ExecScript::output(0, "a b"));

        exec_run(&docker, "app", &ExecSpec::shell("ls").interactive(), TIMEOUT)
            .await
            .unwrap();

        let created = docker.exec_specs();
        assert!(!created[0].tty);
        assert!(!created[0].attach_stdin);
    }

    #[tokio::test]
    async fn test_exec_stream_delivers_chunks() {
        let docker = StubDocker::new();
        docker.script_exec("./bootstrap.sh", ExecScript::output(3, "step 1\nstep 2\n"));

        let mut seen = Vec::new();
        let code = exec_stream(
            &docker,
            "app",
            &ExecSpec::shell("./bootstrap.sh"),
            TIMEOUT,
            |chunk| seen.extend_from_slice(&chunk),
        )
        .await
        .unwrap();

        assert_eq!(code, 3);
        assert_eq!(seen, b"step 1\nstep 2\n".to_vec());
    }

    #[tokio::test]
    async fn test_exec_on_missing_container_is_not_found() {
        let docker = StubDocker::new();
        docker.mark_missing("gone");

        let err = exec_run(&docker, "gone", &ExecSpec::shell("true"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
