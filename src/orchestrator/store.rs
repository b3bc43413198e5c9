//! Persistence seam for sandbox records.
//!
//! The orchestrator only needs three primitives. Transitions are applied to
//! the [`Sandbox`] value through its transition table, then written back
//! with [`SandboxStore::update`].

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::orchestrator::error::Result as OrchestratorResult;
use crate::orchestrator::state::{Sandbox, SandboxEvent, SandboxState};

/// Where sandbox records live.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Load one sandbox.
    async fn load(&self, id: Uuid) -> Result<Sandbox, StoreError>;

    /// All sandboxes currently in `state`.
    async fn list_by_state(&self, state: SandboxState) -> Result<Vec<Sandbox>, StoreError>;

    /// Insert or replace a sandbox record.
    async fn update(&self, sandbox: &Sandbox) -> Result<(), StoreError>;

    /// Load, apply `event`, persist. An illegal event leaves the stored
    /// record untouched.
    async fn transition(&self, id: Uuid, event: SandboxEvent) -> OrchestratorResult<Sandbox> {
        let mut sandbox = self.load(id).await?;
        sandbox.apply(event)?;
        self.update(&sandbox).await?;
        Ok(sandbox)
    }
}

/// Process-local store.
#[derive(Default)]
pub struct InMemorySandboxStore {
    records: RwLock<HashMap<Uuid, Sandbox>>,
}

impl InMemorySandboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxStore for InMemorySandboxStore {
    async fn load(&self, id: Uuid) -> Result<Sandbox, StoreError> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_by_state(&self, state: SandboxState) -> Result<Vec<Sandbox>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|s| s.state() == state)
            .cloned()
            .collect())
    }

    async fn update(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(sandbox.id, sandbox.clone());
        Ok(())
    }
}

/// Store backed by one JSON file, used by the CLI so separate invocations
/// see the same sandboxes.
///
/// The whole file is rewritten on every update; fine for a handful of
/// sandboxes on one machine.
pub struct JsonFileSandboxStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonFileSandboxStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    async fn read_all(&self) -> Result<HashMap<Uuid, Sandbox>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) if raw.is_empty() => Ok(HashMap::new()),
            Ok(raw) => {
                let records: Vec<Sandbox> = serde_json::from_slice(&raw).map_err(|e| {
                    StoreError::Backend(format!("{}: {}", self.path.display(), e))
                })?;
                Ok(records.into_iter().map(|s| (s.id, s)).collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StoreError::Backend(format!("{}: {}", self.path.display(), e))),
        }
    }
}

#[async_trait]
impl SandboxStore for JsonFileSandboxStore {
    async fn load(&self, id: Uuid) -> Result<Sandbox, StoreError> {
        let _guard = self.lock.read().await;
        self.read_all()
            .await?
            .remove(&id)
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_by_state(&self, state: SandboxState) -> Result<Vec<Sandbox>, StoreError> {
        let _guard = self.lock.read().await;
        Ok(self
            .read_all()
            .await?
            .into_values()
            .filter(|s| s.state() == state)
            .collect())
    }

    async fn update(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        let _guard = self.lock.write().await;
        let mut records = self.read_all().await?;
        records.insert(sandbox.id, sandbox.clone());

        let mut sorted: Vec<&Sandbox> = records.values().collect();
        sorted.sort_by_key(|s| s.created_at);
        let json = serde_json::to_vec_pretty(&sorted)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Backend(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Backend(format!("{}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::error::OrchestratorError;

    #[tokio::test]
    async fn test_in_memory_transition_persists() {
        let store = InMemorySandboxStore::new();
        let sandbox = Sandbox::new("demo", "dev");
        store.update(&sandbox).await.unwrap();

        let updated = store
            .transition(sandbox.id, SandboxEvent::BeginProvisioning)
            .await
            .unwrap();
        assert_eq!(updated.state(), SandboxState::Provisioning);
        assert_eq!(
            store.load(sandbox.id).await.unwrap().state(),
            SandboxState::Provisioning
        );

        let rejected = store.transition(sandbox.id, SandboxEvent::Stop).await;
        assert!(matches!(rejected, Err(OrchestratorError::InvalidTransition(_))));
        assert_eq!(
            store.load(sandbox.id).await.unwrap().state(),
            SandboxState::Provisioning
        );
    }

    #[tokio::test]
    async fn test_in_memory_missing_record() {
        let store = InMemorySandboxStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(store.load(id).await, Err(StoreError::NotFound(found)) if found == id));
    }

    #[tokio::test]
    async fn test_json_file_store_round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandboxes.json");

        let mut sandbox = Sandbox::new("demo", "dev");
        sandbox.apply(SandboxEvent::BeginProvisioning).unwrap();
        sandbox.app_container_id = Some("abc".to_string());
        JsonFileSandboxStore::new(&path).update(&sandbox).await.unwrap();

        let reopened = JsonFileSandboxStore::new(&path);
        let loaded = reopened.load(sandbox.id).await.unwrap();
        assert_eq!(loaded, sandbox);
        assert_eq!(
            reopened
                .list_by_state(SandboxState::Provisioning)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(reopened
            .list_by_state(SandboxState::Running)
            .await
            .unwrap()
            .is_empty());
    }
}
