//! Caller-owned lookup of live sessions by (sandbox, label).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::docker::DockerApi;
use crate::session::actor::{SessionHandle, SessionKind, SessionOptions, SessionSink, start_session};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    sandbox_id: Uuid,
    label: String,
}

/// Keeps at most one live session per (sandbox, label).
///
/// Starting a session on an occupied key stops the previous session and
/// waits for its teardown before the new one is started.
pub struct SessionRegistry {
    docker: Arc<dyn DockerApi>,
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(docker: Arc<dyn DockerApi>) -> Self {
        Self {
            docker,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session, replacing any existing one with the same key.
    ///
    /// The previous session is stopped outside the lock, so a slow teardown
    /// only delays this call. The new session is inserted only once the key
    /// is vacant; a session that slipped in meanwhile is stopped too.
    pub async fn start(
        &self,
        kind: Arc<dyn SessionKind>,
        options: SessionOptions,
        sink: SessionSink,
    ) -> SessionHandle {
        let key = SessionKey {
            sandbox_id: options.sandbox_id,
            label: options.label.clone(),
        };

        loop {
            let previous = {
                let mut sessions = self.sessions.lock().await;
                match sessions.remove(&key) {
                    Some(previous) => previous,
                    None => {
                        let handle = start_session(self.docker.clone(), kind, options, sink);
                        sessions.insert(key, handle.clone());
                        return handle;
                    }
                }
            };

            tracing::debug!(
                sandbox_id = %key.sandbox_id,
                label = %key.label,
                session_id = %previous.id(),
                "Replacing existing session"
            );
            previous.stop().await;
        }
    }

    /// Look up a live session.
    pub async fn get(&self, sandbox_id: Uuid, label: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, h| !h.is_closed());
        sessions
            .get(&SessionKey {
                sandbox_id,
                label: label.to_string(),
            })
            .cloned()
    }

    /// Stop one session. Returns false if none was registered.
    pub async fn stop(&self, sandbox_id: Uuid, label: &str) -> bool {
        let handle = self.sessions.lock().await.remove(&SessionKey {
            sandbox_id,
            label: label.to_string(),
        });
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every session belonging to a sandbox, e.g. before it is destroyed.
    pub async fn stop_sandbox(&self, sandbox_id: Uuid) -> usize {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<SessionKey> = sessions
                .keys()
                .filter(|k| k.sandbox_id == sandbox_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        let count = handles.len();
        futures::future::join_all(handles.iter().map(|h| h.stop())).await;
        if count > 0 {
            tracing::info!(sandbox_id = %sandbox_id, count, "Stopped sandbox sessions");
        }
        count
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, h| !h.is_closed());
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::session::actor::{SessionEvent, SessionState};
    use crate::session::dev_server::{DEV_SERVER_LABEL, DevServer};
    use crate::testing::StubDocker;

    #[tokio::test]
    async fn test_occupied_key_stops_previous_session() {
        let docker = Arc::new(StubDocker::new());
        let registry = SessionRegistry::new(docker.clone());
        let sandbox = Uuid::new_v4();
        let kind = Arc::new(DevServer::new("npm run dev"));

        let (sink_a, mut events_a) = mpsc::channel(8);
        let first = registry
            .start(
                kind.clone(),
                SessionOptions::new(sandbox, "app", DEV_SERVER_LABEL),
                sink_a,
            )
            .await;
        let _peer_a = docker.take_exec_peer().await;

        let (sink_b, _events_b) = mpsc::channel(8);
        let second = registry
            .start(kind, SessionOptions::new(sandbox, "app", DEV_SERVER_LABEL), sink_b)
            .await;

        assert_eq!(first.state(), SessionState::Closed);
        let mut saw_closed = false;
        while let Ok(event) = events_a.try_recv() {
            saw_closed |= matches!(event, SessionEvent::Closed { .. });
        }
        assert!(saw_closed);

        let current = registry.get(sandbox, DEV_SERVER_LABEL).await.unwrap();
        assert_eq!(current.id(), second.id());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_stop_sandbox_only_touches_that_sandbox() {
        let docker = Arc::new(StubDocker::new());
        let registry = SessionRegistry::new(docker.clone());
        let kind = Arc::new(DevServer::new("npm run dev"));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let (sink, _events) = mpsc::channel(64);
        registry
            .start(kind.clone(), SessionOptions::new(a, "app-a", "x"), sink.clone())
            .await;
        registry
            .start(kind.clone(), SessionOptions::new(a, "app-a", "y"), sink.clone())
            .await;
        registry
            .start(kind, SessionOptions::new(b, "app-b", "x"), sink)
            .await;

        assert_eq!(registry.stop_sandbox(a).await, 2);
        assert!(registry.get(a, "x").await.is_none());
        assert!(registry.get(b, "x").await.is_some());
        assert!(!registry.stop(a, "x").await);
    }
}
