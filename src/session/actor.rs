//! The exec session actor.
//!
//! One tokio task per session owns the upgraded exec socket exclusively.
//! Callers talk to it through a cloneable [`SessionHandle`]; output and
//! lifecycle events flow back on the [`SessionSink`] supplied at start.
//!
//! ```text
//!   SessionHandle ──Command──▶ ┌──────────────┐ ──bytes──▶ exec socket (stdin)
//!                              │ session task │
//!   SessionSink ◀──Event────── └──────────────┘ ◀─chunks── reader task
//! ```
//!
//! Whatever ends the session (peer close, socket error, explicit stop, the
//! sink or every handle being dropped), teardown is the same: inspect the
//! exec for its pid, signal that process group, then release the socket,
//! then report `Closed`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::docker::upgrade::{self, ExecWriter};
use crate::docker::{DockerApi, DockerError, ExecSpec};
use crate::session::teardown::terminate_process_tree;
use crate::session::utf8::Utf8Accumulator;

/// Longest tail of earlier output kept for matching a ready banner that
/// straddles two chunks.
const READY_WINDOW: usize = 256;

/// Socket chunks read ahead of the UI sink. When full, the reader stops
/// reading and the remote process blocks on its own output.
const READER_QUEUE: usize = 16;

/// Errors returned to session callers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(Uuid),

    #[error("Session {0} does not accept input")]
    InputNotSupported(Uuid),

    #[error(transparent)]
    Docker(#[from] DockerError),
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Attached,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The exec stream could not be opened.
    OpenFailed(String),
    /// The process exited and the daemon closed the stream.
    PeerClosed,
    /// Reading or writing the socket failed.
    SocketError(String),
    /// `stop` was called.
    Stopped,
    /// The UI sink went away, or every handle was dropped.
    Detached,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenFailed(e) => write!(f, "failed to open session: {}", e),
            Self::PeerClosed => write!(f, "process exited"),
            Self::SocketError(e) => write!(f, "connection error: {}", e),
            Self::Stopped => write!(f, "stopped"),
            Self::Detached => write!(f, "client detached"),
        }
    }
}

/// Events delivered to the UI sink, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Decoded output. Never splits a UTF-8 character.
    Output(String),
    /// The ready banner was seen. Sent at most once.
    Ready,
    /// Terminal event; nothing follows it.
    Closed { reason: CloseReason },
}

/// Where a session sends its events.
pub type SessionSink = mpsc::Sender<SessionEvent>;

/// Per-variant behaviour plugged into the generic actor.
#[async_trait]
pub trait SessionKind: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Run container-side setup and choose the command to exec.
    ///
    /// Setup problems are logged, never returned.
    async fn prepare(&self, docker: &dyn DockerApi, options: &SessionOptions) -> ExecSpec;

    /// Whether the UI may write to the process.
    fn accepts_input(&self) -> bool {
        true
    }

    /// Output pattern that marks the process as ready.
    fn ready_pattern(&self) -> Option<&Regex> {
        None
    }

    /// Called once, from the session task, when the ready pattern matches.
    /// Must not block; spawn anything long-running.
    fn on_ready(&self, _docker: Arc<dyn DockerApi>, _options: &SessionOptions) {}
}

/// Where and as whom a session runs.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub sandbox_id: Uuid,
    pub container: String,
    pub label: String,
    pub user: String,
    pub workdir: String,
    /// Bound on each teardown Docker call.
    pub teardown_timeout: Duration,
}

impl SessionOptions {
    pub fn new(sandbox_id: Uuid, container: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            sandbox_id,
            container: container.into(),
            label: label.into(),
            user: "root".to_string(),
            workdir: "/".to_string(),
            teardown_timeout: Duration::from_secs(10),
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }
}

enum Command {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
}

/// What the session loop does after delivering an event.
enum Flow {
    Continue,
    Stopped,
    Detached,
}

/// Caller-held reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    sandbox_id: Uuid,
    label: String,
    accepts_input: bool,
    commands: mpsc::Sender<Command>,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<SessionState>,
    ready: watch::Receiver<bool>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("sandbox_id", &self.sandbox_id)
            .field("label", &self.label)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sandbox_id(&self) -> Uuid {
        self.sandbox_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Whether the ready banner has been seen.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Write bytes to the process's stdin.
    pub async fn send_input(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        if !self.accepts_input {
            return Err(SessionError::InputNotSupported(self.id));
        }
        self.commands
            .send(Command::Input(data.into()))
            .await
            .map_err(|_| SessionError::Closed(self.id))
    }

    /// Request a terminal resize. Returns as soon as the request is queued;
    /// failures of the resize call itself are only logged.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.commands
            .send(Command::Resize { cols, rows })
            .await
            .map_err(|_| SessionError::Closed(self.id))
    }

    /// Stop the session and wait for teardown to finish.
    ///
    /// The request is a flag rather than a queued command, so it is seen
    /// even while the session is blocked on a full sink. Stopping an
    /// already-closed session is a no-op.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.closed().await;
    }

    /// Wait until the session has closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Start a session and return its handle immediately.
///
/// Setup and the exec upgrade run on the session task; if opening fails
/// the sink receives `Closed { reason: OpenFailed(..) }`.
pub fn start_session(
    docker: Arc<dyn DockerApi>,
    kind: Arc<dyn SessionKind>,
    options: SessionOptions,
    sink: SessionSink,
) -> SessionHandle {
    let id = Uuid::new_v4();
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(SessionState::Starting);
    let (ready_tx, ready_rx) = watch::channel(false);

    let handle = SessionHandle {
        id,
        sandbox_id: options.sandbox_id,
        label: options.label.clone(),
        accepts_input: kind.accepts_input(),
        commands: commands_tx,
        stop: Arc::new(stop_tx),
        state: state_rx,
        ready: ready_rx,
    };

    let actor = SessionActor {
        id,
        docker,
        kind,
        options,
        sink,
        stop: stop_rx,
        state: state_tx,
        ready: ready_tx,
        utf8: Utf8Accumulator::new(),
        ready_window: String::new(),
    };
    tokio::spawn(actor.run(commands_rx));

    handle
}

struct SessionActor {
    id: Uuid,
    docker: Arc<dyn DockerApi>,
    kind: Arc<dyn SessionKind>,
    options: SessionOptions,
    sink: SessionSink,
    stop: watch::Receiver<bool>,
    state: watch::Sender<SessionState>,
    ready: watch::Sender<bool>,
    utf8: Utf8Accumulator,
    ready_window: String,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let spec = self.kind.prepare(self.docker.as_ref(), &self.options).await;

        let exec_id = match self.docker.create_exec(&self.options.container, &spec).await {
            Ok(id) => id,
            Err(e) => return self.fail_open(e, &mut commands).await,
        };
        let conn = match self.docker.start_exec_stream(&exec_id, spec.tty).await {
            Ok(conn) => conn,
            Err(e) => return self.fail_open(e, &mut commands).await,
        };

        let (reader, writer, first_chunk) = conn.into_split();
        let (chunk_tx, mut chunks) = mpsc::channel(READER_QUEUE);
        let (ended_tx, mut ended) = tokio::sync::oneshot::channel();
        let reader_task = tokio::spawn(async move {
            let result = upgrade::receive_into(reader, first_chunk, chunk_tx).await;
            let _ = ended_tx.send(result);
        });

        let _ = self.state.send(SessionState::Attached);
        tracing::info!(
            session_id = %self.id,
            sandbox_id = %self.options.sandbox_id,
            kind = self.kind.name(),
            label = %self.options.label,
            exec_id = %exec_id,
            "Session attached"
        );

        let mut writer = writer;
        let mut stop = self.stop.clone();
        let reason = loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => match self.forward(&chunk).await {
                        Flow::Continue => {}
                        Flow::Stopped => break CloseReason::Stopped,
                        Flow::Detached => break CloseReason::Detached,
                    },
                    // The reader drops its sender when it returns.
                    None => match (&mut ended).await {
                        Ok(Err(e)) => break CloseReason::SocketError(e.to_string()),
                        _ => break CloseReason::PeerClosed,
                    },
                },
                stopped = async { stop.wait_for(|s| *s).await.is_ok() } => {
                    break if stopped { CloseReason::Stopped } else { CloseReason::Detached };
                }
                cmd = commands.recv() => match cmd {
                    Some(Command::Input(data)) => {
                        if let Err(e) = upgrade::send(&mut writer, &data).await {
                            break CloseReason::SocketError(e.to_string());
                        }
                    }
                    Some(Command::Resize { cols, rows }) => self.spawn_resize(&exec_id, cols, rows),
                    None => break CloseReason::Detached,
                },
                _ = self.sink.closed() => break CloseReason::Detached,
            }
        };

        commands.close();
        self.teardown(&exec_id, writer, reader_task, reason).await;
    }

    async fn fail_open(mut self, error: DockerError, commands: &mut mpsc::Receiver<Command>) {
        tracing::warn!(
            session_id = %self.id,
            sandbox_id = %self.options.sandbox_id,
            kind = self.kind.name(),
            "Failed to open exec stream: {}",
            error
        );
        commands.close();
        self.close(CloseReason::OpenFailed(error.to_string()), String::new())
            .await;
    }

    /// Forward one output chunk through UTF-8 reassembly.
    async fn forward(&mut self, chunk: &[u8]) -> Flow {
        tracing::trace!(session_id = %self.id, bytes = chunk.len(), "Session output");
        let text = self.utf8.push(chunk);
        if text.is_empty() {
            return Flow::Continue;
        }

        let became_ready = self.check_ready(&text);
        let flow = self.deliver(SessionEvent::Output(text)).await;
        if !matches!(flow, Flow::Continue) || !became_ready {
            return flow;
        }

        let _ = self.ready.send(true);
        tracing::info!(session_id = %self.id, kind = self.kind.name(), "Session ready");
        self.kind.on_ready(self.docker.clone(), &self.options);
        self.deliver(SessionEvent::Ready).await
    }

    /// Send to the sink, giving up if a stop arrives while it is full.
    async fn deliver(&self, event: SessionEvent) -> Flow {
        let mut stop = self.stop.clone();
        tokio::select! {
            sent = self.sink.send(event) => {
                if sent.is_ok() { Flow::Continue } else { Flow::Detached }
            }
            stopped = stop.wait_for(|s| *s) => {
                if stopped.is_ok() { Flow::Stopped } else { Flow::Detached }
            }
        }
    }

    fn check_ready(&mut self, text: &str) -> bool {
        if *self.ready.borrow() {
            return false;
        }
        let Some(pattern) = self.kind.ready_pattern() else {
            return false;
        };

        self.ready_window.push_str(text);
        let matched = pattern.is_match(&self.ready_window);

        if self.ready_window.len() > READY_WINDOW {
            let mut cut = self.ready_window.len() - READY_WINDOW;
            while !self.ready_window.is_char_boundary(cut) {
                cut += 1;
            }
            self.ready_window.drain(..cut);
        }
        matched
    }

    fn spawn_resize(&self, exec_id: &str, cols: u16, rows: u16) {
        let docker = self.docker.clone();
        let exec_id = exec_id.to_string();
        let session_id = self.id;
        tokio::spawn(async move {
            if let Err(e) = docker.resize_exec(&exec_id, cols, rows).await {
                tracing::debug!(session_id = %session_id, cols, rows, "Resize failed: {}", e);
            }
        });
    }

    /// Signal the process group, then release the socket, then report.
    async fn teardown(
        &mut self,
        exec_id: &str,
        writer: ExecWriter,
        reader_task: JoinHandle<()>,
        reason: CloseReason,
    ) {
        let timeout = self.options.teardown_timeout;
        let container = self.options.container.clone();

        match tokio::time::timeout(timeout, self.docker.inspect_exec(exec_id)).await {
            Ok(Ok(inspect)) => {
                if let Err(e) =
                    terminate_process_tree(self.docker.as_ref(), &container, inspect.pid, timeout)
                        .await
                {
                    tracing::warn!(
                        session_id = %self.id,
                        container = %container,
                        pid = inspect.pid,
                        "Failed to signal session process tree: {}",
                        e
                    );
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(session_id = %self.id, exec_id = %exec_id, "Exec inspect failed during teardown: {}", e);
            }
            Err(_) => {
                tracing::warn!(session_id = %self.id, exec_id = %exec_id, "Exec inspect timed out during teardown");
            }
        }

        drop(writer);
        reader_task.abort();
        let _ = reader_task.await;

        let rest = self.utf8.finish();
        self.close(reason, rest).await;
    }

    /// Report the final events and mark the session closed.
    ///
    /// Events that fit are queued before the state flips, so a caller that
    /// waited for `stop` finds `Closed` in a drained sink. Anything that does
    /// not fit is sent afterwards with a bound, since a sink nobody drains
    /// must not keep the task alive.
    async fn close(&mut self, reason: CloseReason, rest: String) {
        tracing::info!(
            session_id = %self.id,
            sandbox_id = %self.options.sandbox_id,
            kind = self.kind.name(),
            reason = %reason,
            "Session closed"
        );

        let mut events = Vec::with_capacity(2);
        if !rest.is_empty() {
            events.push(SessionEvent::Output(rest));
        }
        events.push(SessionEvent::Closed { reason });

        let mut pending = events.into_iter();
        let mut blocked = None;
        for event in pending.by_ref() {
            match self.sink.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    blocked = Some(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }

        let _ = self.state.send(SessionState::Closed);

        if let Some(event) = blocked {
            let timeout = self.options.teardown_timeout;
            for event in std::iter::once(event).chain(pending) {
                if self.sink.send_timeout(event, timeout).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::testing::StubDocker;

    struct Echo;

    #[async_trait]
    impl SessionKind for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn prepare(&self, _docker: &dyn DockerApi, _options: &SessionOptions) -> ExecSpec {
            ExecSpec::new(["cat"]).interactive()
        }
    }

    fn options() -> SessionOptions {
        SessionOptions::new(Uuid::new_v4(), "app", "main")
    }

    async fn next_output(events: &mut mpsc::Receiver<SessionEvent>) -> String {
        match events.recv().await {
            Some(SessionEvent::Output(text)) => text,
            other => panic!("expected output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_input_and_output_flow() {
        let docker = Arc::new(StubDocker::new());
        let (sink, mut events) = mpsc::channel(16);
        let handle = start_session(docker.clone(), Arc::new(Echo), options(), sink);

        let mut peer = docker.take_exec_peer().await;
        handle.send_input("ls\n").await.unwrap();

        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        peer.write_all(b"file.txt\r\n").await.unwrap();
        assert_eq!(next_output(&mut events).await, "file.txt\r\n");
        assert_eq!(handle.state(), SessionState::Attached);

        handle.stop().await;
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_split_utf8_is_reassembled() {
        let docker = Arc::new(StubDocker::new());
        let (sink, mut events) = mpsc::channel(16);
        let _handle = start_session(docker.clone(), Arc::new(Echo), options(), sink);

        let mut peer = docker.take_exec_peer().await;
        peer.write_all(b"\xE2\x82").await.unwrap();
        peer.flush().await.unwrap();
        tokio::task::yield_now().await;
        peer.write_all(b"\xAC").await.unwrap();

        let mut text = String::new();
        while text != "€" {
            text.push_str(&next_output(&mut events).await);
        }
    }

    #[tokio::test]
    async fn test_open_failure_closes_and_notifies() {
        let docker = Arc::new(StubDocker::new());
        docker.mark_missing("app");
        let (sink, mut events) = mpsc::channel(16);
        let handle = start_session(docker, Arc::new(Echo), options(), sink);

        match events.recv().await {
            Some(SessionEvent::Closed {
                reason: CloseReason::OpenFailed(msg),
            }) => assert!(msg.contains("404")),
            other => panic!("unexpected event {other:?}"),
        }
        handle.closed().await;
        assert!(handle.send_input("x").await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_runs_teardown() {
        let docker = Arc::new(StubDocker::new());
        let (sink, mut events) = mpsc::channel(16);
        let handle = start_session(docker.clone(), Arc::new(Echo), options(), sink);

        let peer = docker.take_exec_peer().await;
        drop(peer);

        loop {
            match events.recv().await {
                Some(SessionEvent::Closed { reason }) => {
                    assert_eq!(reason, CloseReason::PeerClosed);
                    break;
                }
                Some(_) => continue,
                None => panic!("sink closed without a Closed event"),
            }
        }
        assert!(docker.calls().iter().any(|c| c.starts_with("exec:sh -c kill -TERM")));
        handle.closed().await;
    }

    #[tokio::test]
    async fn test_dropping_sink_detaches() {
        let docker = Arc::new(StubDocker::new());
        let (sink, events) = mpsc::channel(16);
        let handle = start_session(docker.clone(), Arc::new(Echo), options(), sink);
        let _peer = docker.take_exec_peer().await;

        drop(events);
        handle.closed().await;
        assert!(docker.calls().iter().any(|c| c.contains("kill -TERM")));
    }
}
