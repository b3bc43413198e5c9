//! `attach`: bridge a terminal session to the local tty.
//!
//! The local terminal is switched to raw mode so keystrokes (including
//! Ctrl-C) reach the remote shell. Ctrl-] detaches.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::docker::{DockerApi, DockerClient};
use crate::session::{
    SessionEvent, SessionHandle, SessionOptions, SessionRegistry, SetupPlan, Terminal,
};

/// Ctrl-]
const DETACH_BYTE: u8 = 0x1d;

/// Restores cooked mode when dropped, including on early return.
struct RawMode;

impl RawMode {
    fn enable() -> anyhow::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            tracing::warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

pub async fn run_attach_command(
    config: &Config,
    container: &str,
    label: &str,
    user: &str,
) -> anyhow::Result<()> {
    let docker: Arc<dyn DockerApi> = Arc::new(DockerClient::new(config.docker.clone()));
    let registry = SessionRegistry::new(docker);

    // Not tied to a recorded sandbox.
    let options = SessionOptions::new(Uuid::nil(), container, label)
        .user(user)
        .workdir(config.sandbox.workdir.clone());
    let plan = SetupPlan::new(user, config.sandbox.user_uid);

    let (sink, mut events) = mpsc::channel(256);
    let handle = registry
        .start(Arc::new(Terminal::new(plan)), options, sink)
        .await;

    let raw = RawMode::enable()?;
    if let Ok((cols, rows)) = crossterm::terminal::size() {
        handle.resize(cols, rows).await?;
    }

    let input = tokio::spawn(forward_stdin(handle.clone()));
    let mut stdout = tokio::io::stdout();
    let mut reason = None;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Output(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            SessionEvent::Ready => {}
            SessionEvent::Closed { reason: r } => {
                reason = Some(r);
                break;
            }
        }
    }

    input.abort();
    drop(raw);

    if let Some(reason) = reason {
        eprintln!("\n[session closed: {}]", reason);
    }
    Ok(())
}

async fn forward_stdin(handle: SessionHandle) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = &buf[..n];
        if let Some(pos) = chunk.iter().position(|b| *b == DETACH_BYTE) {
            if pos > 0 {
                let _ = handle.send_input(chunk[..pos].to_vec()).await;
            }
            break;
        }
        if handle.send_input(chunk.to_vec()).await.is_err() {
            return;
        }
    }
    handle.stop().await;
}
