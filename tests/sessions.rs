//! Session teardown ordering, backpressure, resize forwarding and registry
//! replacement.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use devsandbox::session::{
    CloseReason, SessionEvent, SessionOptions, SessionRegistry, SetupPlan, Terminal,
    start_session,
};
use devsandbox::testing::StubDocker;

fn options(sandbox_id: Uuid, label: &str) -> SessionOptions {
    SessionOptions::new(sandbox_id, "app", label)
        .user("dev")
        .workdir("/workspace")
}

fn terminal() -> Arc<Terminal> {
    Arc::new(Terminal::new(SetupPlan::new("dev", 1000)))
}

/// Poll the call log until `pred` holds.
async fn wait_for_calls<F>(docker: &StubDocker, pred: F)
where
    F: Fn(&[String]) -> bool,
{
    for _ in 0..200 {
        if pred(&docker.calls()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met; calls: {:?}", docker.calls());
}

/// Exec id and pid the stub assigned to the interactive exec.
fn interactive_exec(docker: &StubDocker) -> (String, i64) {
    let index = docker
        .exec_specs()
        .iter()
        .position(|s| s.tty && s.attach_stdin)
        .expect("no interactive exec was created");
    let n = index as i64 + 1;
    (format!("exec-{}", n), 100 + n)
}

#[tokio::test]
async fn stop_signals_process_group_before_releasing_socket() {
    let docker = Arc::new(StubDocker::new());
    let (sink, mut events) = mpsc::channel(64);
    let handle = start_session(docker.clone(), terminal(), options(Uuid::new_v4(), "main"), sink);

    let mut peer = docker.take_exec_peer().await;
    let (exec_id, pid) = interactive_exec(&docker);

    handle.stop().await;

    let calls = docker.calls();
    let inspect = calls
        .iter()
        .position(|c| *c == format!("inspect_exec:{}", exec_id))
        .expect("exec was not inspected");
    let kill = calls
        .iter()
        .position(|c| c.contains(&format!("kill -TERM -- -{}", pid)))
        .expect("process group was not signalled");
    let release = calls
        .iter()
        .position(|c| *c == format!("release_exec:{}", exec_id))
        .expect("socket was not released");
    assert!(inspect < kill);
    assert!(kill < release);

    let mut buf = [0u8; 16];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

    let mut reason = None;
    while let Some(event) = events.recv().await {
        if let SessionEvent::Closed { reason: r } = event {
            reason = Some(r);
            break;
        }
    }
    assert_eq!(reason, Some(CloseReason::Stopped));
}

#[tokio::test]
async fn stop_completes_while_sink_is_full() {
    let docker = Arc::new(StubDocker::new());
    // Capacity one and never read: the second output event cannot be delivered.
    let (sink, _events) = mpsc::channel(1);
    let handle = start_session(docker.clone(), terminal(), options(Uuid::new_v4(), "main"), sink);

    let mut peer = docker.take_exec_peer().await;
    let (exec_id, pid) = interactive_exec(&docker);
    for i in 0..5 {
        peer.write_all(format!("line {}\n", i).as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::timeout(Duration::from_secs(3), handle.stop())
        .await
        .expect("stop did not return with a full sink");
    assert!(handle.is_closed());

    let calls = docker.calls();
    let kill = calls
        .iter()
        .position(|c| c.contains(&format!("kill -TERM -- -{}", pid)))
        .expect("process group was not signalled");
    let release = calls
        .iter()
        .position(|c| *c == format!("release_exec:{}", exec_id))
        .expect("socket was not released");
    assert!(kill < release);
}

#[tokio::test]
async fn each_resize_is_forwarded_once() {
    let docker = Arc::new(StubDocker::new());
    let (sink, _events) = mpsc::channel(64);
    let handle = start_session(docker.clone(), terminal(), options(Uuid::new_v4(), "main"), sink);
    let _peer = docker.take_exec_peer().await;

    handle.resize(80, 24).await.unwrap();
    handle.resize(120, 40).await.unwrap();

    wait_for_calls(&docker, |calls| {
        calls.iter().any(|c| c.ends_with(":80x24")) && calls.iter().any(|c| c.ends_with(":120x40"))
    })
    .await;
    // Give a duplicate the chance to land before counting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = docker.calls();

    let resizes: Vec<&String> = calls.iter().filter(|c| c.starts_with("resize:")).collect();
    assert_eq!(resizes.len(), 2);
    assert_eq!(calls.iter().filter(|c| c.ends_with(":80x24")).count(), 1);
    assert_eq!(calls.iter().filter(|c| c.ends_with(":120x40")).count(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn registry_replaces_session_with_same_label() {
    let docker = Arc::new(StubDocker::new());
    let registry = SessionRegistry::new(docker.clone());
    let sandbox_id = Uuid::new_v4();

    let (sink, _events) = mpsc::channel(64);
    let first = registry
        .start(terminal(), options(sandbox_id, "main"), sink)
        .await;
    let mut first_peer = docker.take_exec_peer().await;

    let (sink, _events2) = mpsc::channel(64);
    let second = registry
        .start(terminal(), options(sandbox_id, "main"), sink)
        .await;

    // The first session was fully torn down before the second started.
    assert!(first.is_closed());
    let mut buf = [0u8; 8];
    assert_eq!(first_peer.read(&mut buf).await.unwrap(), 0);

    let _second_peer = docker.take_exec_peer().await;
    assert_eq!(registry.len().await, 1);
    assert_eq!(
        registry.get(sandbox_id, "main").await.map(|h| h.id()),
        Some(second.id())
    );

    assert_eq!(registry.stop_sandbox(sandbox_id).await, 1);
    assert!(second.is_closed());
}

#[tokio::test]
async fn other_labels_are_independent() {
    let docker = Arc::new(StubDocker::new());
    let registry = SessionRegistry::new(docker.clone());
    let sandbox_id = Uuid::new_v4();

    let (sink_a, _a) = mpsc::channel(64);
    let a = registry.start(terminal(), options(sandbox_id, "a"), sink_a).await;
    let _peer_a = docker.take_exec_peer().await;

    let (sink_b, _b) = mpsc::channel(64);
    let b = registry.start(terminal(), options(sandbox_id, "b"), sink_b).await;
    let _peer_b = docker.take_exec_peer().await;

    assert!(!a.is_closed());
    assert!(!b.is_closed());
    assert_eq!(registry.len().await, 2);

    assert!(registry.stop(sandbox_id, "a").await);
    assert!(a.is_closed());
    assert!(!b.is_closed());
    b.stop().await;
}

#[tokio::test]
async fn replacement_teardown_does_not_block_other_lookups() {
    let docker = Arc::new(StubDocker::new());
    let registry = Arc::new(SessionRegistry::new(docker.clone()));
    let sandbox_id = Uuid::new_v4();

    let (sink, _events) = mpsc::channel(64);
    let first = registry
        .start(terminal(), options(sandbox_id, "main"), sink)
        .await;
    let _first_peer = docker.take_exec_peer().await;

    // Each teardown inspect now takes a while.
    docker.delay_exec_inspect(Duration::from_millis(300));
    let replacing = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let (sink, events) = mpsc::channel(64);
            let handle = registry
                .start(terminal(), options(sandbox_id, "main"), sink)
                .await;
            (handle, events)
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let other = tokio::time::timeout(
        Duration::from_millis(100),
        registry.get(Uuid::new_v4(), "main"),
    )
    .await
    .expect("lookup waited for an unrelated teardown");
    assert!(other.is_none());
    assert!(!first.is_closed());

    let (second, _second_events) = replacing.await.unwrap();
    assert!(first.is_closed());
    let _second_peer = docker.take_exec_peer().await;
    assert_eq!(
        registry.get(sandbox_id, "main").await.map(|h| h.id()),
        Some(second.id())
    );
}
