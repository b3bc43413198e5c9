//! In-memory Docker daemon for tests.
//!
//! [`StubDocker`] implements [`DockerApi`] without a socket. It records every
//! call, tracks containers, networks and volumes, and answers exec requests
//! in one of three ways:
//!
//! - a registered [`ExecScript`] whose substring matches the command line
//!   produces canned output and an exit code
//! - an unmatched interactive exec is wired to a duplex pipe whose far end
//!   tests pick up with [`StubDocker::take_exec_peer`]. When the session
//!   side of that pipe is dropped, `release_exec:<id>` is appended to the
//!   call log
//! - anything else exits 0 with no output
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use devsandbox::testing::{ExecScript, StubDocker};
//!
//! let docker = Arc::new(StubDocker::new());
//! docker.script_exec("pg_isready", ExecScript::output(0, "accepting connections"));
//! ```

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{Notify, mpsc};

use crate::docker::frame::encode_frame;
use crate::docker::types::ContainerState;
use crate::docker::upgrade::BoxedExecIo;
use crate::docker::{
    ContainerInspect, ContainerSpec, DockerApi, DockerError, ExecConnection, ExecInspect,
    ExecSpec, Result, VersionInfo,
};

/// Pipe capacity for exec streams.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Canned result for an exec whose command line matches a registered substring.
#[derive(Debug, Clone)]
pub struct ExecScript {
    pub exit_code: i64,
    pub output: Vec<u8>,
}

impl ExecScript {
    /// Exit with `code` after writing `text` to stdout.
    pub fn output(code: i64, text: &str) -> Self {
        Self {
            exit_code: code,
            output: text.as_bytes().to_vec(),
        }
    }
}

/// An archive passed to `upload_archive`.
#[derive(Debug, Clone)]
pub struct Upload {
    pub container: String,
    pub path: String,
    pub archive: Bytes,
}

#[derive(Debug)]
struct StubContainer {
    name: String,
    running: bool,
}

#[derive(Debug)]
struct StubExec {
    script: Option<ExecScript>,
    pid: i64,
    started: bool,
    peer: bool,
}

#[derive(Default)]
struct State {
    scripts: Vec<(String, ExecScript)>,
    missing: HashSet<String>,
    daemon_down: bool,
    containers: HashMap<String, StubContainer>,
    networks: HashSet<String>,
    volumes: HashSet<String>,
    execs: HashMap<String, StubExec>,
    exec_specs: Vec<ExecSpec>,
    calls: Vec<String>,
    uploads: Vec<Upload>,
    next_id: u64,
    inspect_exec_delay: Option<Duration>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_present(&self, operation: &str, id: &str) -> Result<()> {
        if self.missing.contains(id) {
            return Err(not_found(operation, "container", id));
        }
        Ok(())
    }
}

fn not_found(operation: &str, what: &str, id: &str) -> DockerError {
    DockerError::Api {
        operation: operation.to_string(),
        status: 404,
        message: format!("No such {}: {}", what, id),
    }
}

/// Session side of an interactive exec pipe. Logs its release on drop.
struct TrackedPipe {
    inner: DuplexStream,
    exec_id: String,
    state: Arc<Mutex<State>>,
}

impl AsyncRead for TrackedPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedPipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for TrackedPipe {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .push(format!("release_exec:{}", self.exec_id));
    }
}

/// Scriptable fake Docker daemon.
pub struct StubDocker {
    state: Arc<Mutex<State>>,
    specs_changed: Notify,
    peer_tx: mpsc::UnboundedSender<DuplexStream>,
    peer_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

impl Default for StubDocker {
    fn default() -> Self {
        Self::new()
    }
}

impl StubDocker {
    pub fn new() -> Self {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(State::default())),
            specs_changed: Notify::new(),
            peer_tx,
            peer_rx: tokio::sync::Mutex::new(peer_rx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer execs whose joined command line contains `pattern`.
    /// Earlier registrations win.
    pub fn script_exec(&self, pattern: &str, script: ExecScript) {
        self.lock().scripts.push((pattern.to_string(), script));
    }

    /// Make every operation on `id` fail with 404.
    pub fn mark_missing(&self, id: &str) {
        let mut state = self.lock();
        state.containers.remove(id);
        state.missing.insert(id.to_string());
    }

    /// Make every `inspect_exec` take `delay`, e.g. to hold a session in teardown.
    pub fn delay_exec_inspect(&self, delay: Duration) {
        self.lock().inspect_exec_delay = Some(delay);
    }

    /// Make `ping` fail as if the daemon were not listening.
    pub fn set_daemon_down(&self, down: bool) {
        self.lock().daemon_down = down;
    }

    /// Register a running container whose id and name are both `id`.
    pub fn start_named(&self, id: &str) {
        self.lock().containers.insert(
            id.to_string(),
            StubContainer {
                name: id.to_string(),
                running: true,
            },
        );
    }

    /// Every call so far, as `operation:argument` strings.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Exec specs in creation order.
    pub fn exec_specs(&self) -> Vec<ExecSpec> {
        self.lock().exec_specs.clone()
    }

    /// Wait until at least `count` execs have been created.
    pub async fn wait_exec_specs(&self, count: usize) -> Vec<ExecSpec> {
        loop {
            let changed = self.specs_changed.notified();
            {
                let state = self.lock();
                if state.exec_specs.len() >= count {
                    return state.exec_specs.clone();
                }
            }
            changed.await;
        }
    }

    /// Archives uploaded so far.
    pub fn uploads(&self) -> Vec<Upload> {
        self.lock().uploads.clone()
    }

    /// Names of containers that exist.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// The far end of the next interactive exec started without a script.
    pub async fn take_exec_peer(&self) -> DuplexStream {
        let mut rx = self.peer_rx.lock().await;
        match rx.recv().await {
            Some(peer) => peer,
            // The sender lives as long as `self`.
            None => unreachable!("exec peer channel closed"),
        }
    }

    fn record(&self, call: String) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl DockerApi for StubDocker {
    async fn ping(&self) -> Result<()> {
        let state = self.record("ping".to_string());
        if state.daemon_down {
            return Err(DockerError::Connect {
                path: "/var/run/docker.sock".into(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn version(&self) -> Result<VersionInfo> {
        self.record("version".to_string());
        Ok(VersionInfo {
            version: "27.0.0".to_string(),
            api_version: "1.45".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record(format!("pull_image:{}", image));
        Ok(())
    }

    async fn create_container(&self, name: &str, _spec: &ContainerSpec) -> Result<String> {
        let mut state = self.record(format!("create_container:{}", name));
        let id = format!("{}-id", name);
        state.missing.remove(&id);
        state.containers.insert(
            id.clone(),
            StubContainer {
                name: name.to_string(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.record(format!("start_container:{}", id));
        state.check_present("start container", id)?;
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(not_found("start container", "container", id)),
        }
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u64) -> Result<()> {
        let mut state = self.record(format!("stop_container:{}", id));
        state.check_present("stop container", id)?;
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(not_found("stop container", "container", id)),
        }
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        let mut state = self.record(format!("remove_container:{}", id));
        state.check_present("remove container", id)?;
        let key = state
            .containers
            .iter()
            .find(|(key, c)| key.as_str() == id || c.name == id)
            .map(|(key, _)| key.clone());
        match key {
            Some(key) => {
                state.containers.remove(&key);
                Ok(())
            }
            None => Err(not_found("remove container", "container", id)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let state = self.record(format!("inspect_container:{}", id));
        state.check_present("inspect container", id)?;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| not_found("inspect container", "container", id))?;
        Ok(ContainerInspect {
            id: id.to_string(),
            name: format!("/{}", container.name),
            state: ContainerState {
                status: if container.running { "running" } else { "exited" }.to_string(),
                running: container.running,
                pid: if container.running { 1 } else { 0 },
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let mut state = self.record(format!("create_network:{}", name));
        let id = format!("{}-id", name);
        state.networks.insert(id.clone());
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let mut state = self.record(format!("remove_network:{}", id));
        state.check_present("remove network", id)?;
        if state.networks.remove(id) || state.networks.remove(&format!("{}-id", id)) {
            Ok(())
        } else {
            Err(not_found("remove network", "network", id))
        }
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        _aliases: &[String],
    ) -> Result<()> {
        let state = self.record(format!("connect_network:{}:{}", network, container));
        state.check_present("connect network", container)?;
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<String> {
        let mut state = self.record(format!("create_volume:{}", name));
        state.volumes.insert(name.to_string());
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.record(format!("remove_volume:{}", name));
        state.check_present("remove volume", name)?;
        if state.volumes.remove(name) {
            Ok(())
        } else {
            Err(not_found("remove volume", "volume", name))
        }
    }

    async fn upload_archive(&self, container: &str, path: &str, archive: Bytes) -> Result<()> {
        let mut state = self.record(format!("upload_archive:{}:{}", container, path));
        state.check_present("upload archive", container)?;
        state.uploads.push(Upload {
            container: container.to_string(),
            path: path.to_string(),
            archive,
        });
        Ok(())
    }

    async fn create_exec(&self, container: &str, spec: &ExecSpec) -> Result<String> {
        let command = spec.cmd.join(" ");
        let exec_id = {
            let mut state = self.record(format!("exec:{}", command));
            state.check_present("create exec", container)?;
            let script = state
                .scripts
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map(|(_, script)| script.clone());
            let n = state.next();
            let exec_id = format!("exec-{}", n);
            state.execs.insert(
                exec_id.clone(),
                StubExec {
                    script,
                    pid: 100 + n as i64,
                    started: false,
                    peer: false,
                },
            );
            state.exec_specs.push(spec.clone());
            exec_id
        };
        self.specs_changed.notify_waiters();
        Ok(exec_id)
    }

    async fn start_exec_stream(&self, exec_id: &str, tty: bool) -> Result<ExecConnection> {
        let script = {
            let mut state = self.record(format!("start_exec:{}", exec_id));
            let exec = state
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| not_found("start exec", "exec instance", exec_id))?;
            exec.started = true;
            exec.peer = exec.script.is_none() && tty;
            exec.script.clone()
        };

        let (local, mut remote) = tokio::io::duplex(PIPE_CAPACITY);
        let stream: BoxedExecIo = match script {
            Some(script) => {
                let bytes = if tty {
                    script.output
                } else {
                    encode_frame(1, &script.output)
                };
                if !bytes.is_empty() {
                    remote
                        .write_all(&bytes)
                        .await
                        .map_err(|e| DockerError::transport("start exec", e))?;
                }
                drop(remote);
                Box::new(local)
            }
            None if tty => {
                let _ = self.peer_tx.send(remote);
                Box::new(TrackedPipe {
                    inner: local,
                    exec_id: exec_id.to_string(),
                    state: self.state.clone(),
                })
            }
            None => {
                drop(remote);
                Box::new(local)
            }
        };

        Ok(ExecConnection {
            stream,
            first_chunk: Bytes::new(),
        })
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect> {
        let delay = self.lock().inspect_exec_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.record(format!("inspect_exec:{}", exec_id));
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| not_found("inspect exec", "exec instance", exec_id))?;
        let finished = exec.started && !exec.peer;
        Ok(ExecInspect {
            id: exec_id.to_string(),
            running: !finished,
            exit_code: finished.then(|| exec.script.as_ref().map_or(0, |s| s.exit_code)),
            pid: exec.pid,
        })
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        let state = self.record(format!("resize:{}:{}x{}", exec_id, cols, rows));
        if !state.execs.contains_key(exec_id) {
            return Err(not_found("resize exec", "exec instance", exec_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_scripted_exec_writes_frames_and_exits() {
        let docker = StubDocker::new();
        docker.script_exec("echo", ExecScript::output(3, "hi"));

        let exec = docker
            .create_exec("app", &ExecSpec::shell("echo hi"))
            .await
            .unwrap();
        let conn = docker.start_exec_stream(&exec, false).await.unwrap();
        let mut stream = conn.stream;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, encode_frame(1, b"hi"));

        let inspect = docker.inspect_exec(&exec).await.unwrap();
        assert!(!inspect.running);
        assert_eq!(inspect.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_container_is_404() {
        let docker = StubDocker::new();
        docker.mark_missing("gone");
        let err = docker.stop_container("gone", 1).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let docker = StubDocker::new();
        let id = docker
            .create_container("web", &ContainerSpec::new("alpine"))
            .await
            .unwrap();
        assert!(!docker.inspect_container(&id).await.unwrap().state.running);
        docker.start_container(&id).await.unwrap();
        assert!(docker.inspect_container(&id).await.unwrap().state.running);
        assert_eq!(docker.container_names(), vec!["web".to_string()]);

        docker.remove_container(&id, true).await.unwrap();
        assert!(docker.container_names().is_empty());
        assert!(docker.remove_container(&id, true).await.unwrap_err().is_not_found());
    }
}
