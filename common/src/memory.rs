use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::resource::{
    Resource, ResourceKind, StateSelector, WatchEvent, WatchEventType,
};
use crate::store::{ResourceStore, StatusPatch, StoreError};

struct WatchSubscriber {
    kind: ResourceKind,
    selector: StateSelector,
    tx: mpsc::Sender<WatchEvent>,
}

/// In-memory `ResourceStore` with the same version and conflict semantics as
/// the etcd-backed store. Used by the test suites and for local runs without
/// a store backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    resources: Arc<RwLock<HashMap<(ResourceKind, String), Resource>>>,
    subscribers: Arc<Mutex<Vec<WatchSubscriber>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    async fn notify(&self, event_type: WatchEventType, resource: &Resource) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|sub| {
            if sub.kind != resource.kind {
                return !sub.tx.is_closed();
            }
            let wanted = match event_type {
                WatchEventType::Added | WatchEventType::Modified => {
                    sub.selector.matches(resource.status.state)
                }
                WatchEventType::Deleted => true,
            };
            if wanted {
                let event = WatchEvent {
                    event_type,
                    resource: resource.clone(),
                };
                if sub.tx.try_send(event).is_err() && sub.tx.is_closed() {
                    return false;
                }
            }
            !sub.tx.is_closed()
        });
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Resource, StoreError> {
        let resources = self.resources.read().await;
        resources
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind, name))
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let stored = {
            let mut resources = self.resources.write().await;
            let key = (resource.kind, resource.metadata.name.clone());
            if resources.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: resource.kind,
                    name: resource.metadata.name.clone(),
                });
            }
            let mut stored = resource.clone();
            stored.metadata.version = 1;
            resources.insert(key, stored.clone());
            stored
        };
        debug!("created {}/{}", stored.kind, stored.metadata.name);
        self.notify(WatchEventType::Added, &stored).await;
        Ok(stored)
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: StateSelector,
    ) -> Result<Vec<Resource>, StoreError> {
        let resources = self.resources.read().await;
        let mut matching: Vec<Resource> = resources
            .values()
            .filter(|r| r.kind == kind && selector.matches(r.status.state))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(matching)
    }

    async fn update_options(
        &self,
        kind: ResourceKind,
        name: &str,
        options: JsonValue,
    ) -> Result<Resource, StoreError> {
        let stored = {
            let mut resources = self.resources.write().await;
            let entry = resources
                .get_mut(&(kind, name.to_string()))
                .ok_or_else(|| StoreError::not_found(kind, name))?;
            entry.spec.options = options;
            entry.metadata.version += 1;
            entry.clone()
        };
        self.notify(WatchEventType::Modified, &stored).await;
        Ok(stored)
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        name: &str,
        patch: StatusPatch,
    ) -> Result<Resource, StoreError> {
        let stored = {
            let mut resources = self.resources.write().await;
            let entry = resources
                .get_mut(&(kind, name.to_string()))
                .ok_or_else(|| StoreError::not_found(kind, name))?;
            if let Some(expected) = patch.expect_version
                && entry.metadata.version != expected
            {
                return Err(StoreError::Conflict {
                    kind,
                    name: name.to_string(),
                });
            }
            patch.apply(entry);
            entry.metadata.version += 1;
            entry.clone()
        };
        self.notify(WatchEventType::Modified, &stored).await;
        Ok(stored)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), StoreError> {
        let removed = {
            let mut resources = self.resources.write().await;
            resources
                .remove(&(kind, name.to_string()))
                .ok_or_else(|| StoreError::not_found(kind, name))?
        };
        self.notify(WatchEventType::Deleted, &removed).await;
        Ok(())
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        selector: StateSelector,
    ) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        let mut subscribers = self.subscribers.lock().await;
        subscribers.push(WatchSubscriber { kind, selector, tx });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceState;
    use serde_json::json;

    fn subject(name: &str) -> Resource {
        Resource::new(
            ResourceKind::Backup,
            name,
            ResourceState::Processing,
            json!({"instance_guid": "i-1"}),
        )
    }

    #[tokio::test]
    async fn create_then_get_bumps_version() {
        let store = MemoryStore::new();
        let created = store.create(&subject("b-1")).await.unwrap();
        assert_eq!(created.metadata.version, 1);
        let fetched = store.get(ResourceKind::Backup, "b-1").await.unwrap();
        assert_eq!(fetched.metadata.version, 1);

        let err = store.create(&subject("b-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn stale_version_patch_conflicts() {
        let store = MemoryStore::new();
        store.create(&subject("b-1")).await.unwrap();
        let patched = store
            .patch_status(
                ResourceKind::Backup,
                "b-1",
                StatusPatch::new()
                    .response(json!({"stage": "copying"}))
                    .expect_version(1),
            )
            .await
            .unwrap();
        assert_eq!(patched.metadata.version, 2);

        // second writer still holding version 1
        let err = store
            .patch_status(
                ResourceKind::Backup,
                "b-1",
                StatusPatch::new()
                    .response(json!({"stage": "late"}))
                    .expect_version(1),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let current = store.get(ResourceKind::Backup, "b-1").await.unwrap();
        assert_eq!(current.status.response["stage"], "copying");
    }

    #[tokio::test]
    async fn response_patch_preserves_abort_marker() {
        let store = MemoryStore::new();
        store.create(&subject("b-1")).await.unwrap();
        store
            .patch_status(
                ResourceKind::Backup,
                "b-1",
                StatusPatch::new()
                    .state(ResourceState::Aborting)
                    .response(json!({"abort_started_at": "2024-06-01T10:00:00Z"})),
            )
            .await
            .unwrap();
        store
            .patch_status(
                ResourceKind::Backup,
                "b-1",
                StatusPatch::new().response(json!({"stage": "still copying"})),
            )
            .await
            .unwrap();
        let current = store.get(ResourceKind::Backup, "b-1").await.unwrap();
        assert_eq!(
            current.status.response["abort_started_at"],
            "2024-06-01T10:00:00Z"
        );
    }

    #[tokio::test]
    async fn list_filters_kind_and_state() {
        let store = MemoryStore::new();
        store.create(&subject("b-1")).await.unwrap();
        store.create(&subject("b-2")).await.unwrap();
        store
            .patch_status(
                ResourceKind::Backup,
                "b-2",
                StatusPatch::new().state(ResourceState::Succeeded),
            )
            .await
            .unwrap();
        store
            .create(&Resource::new(
                ResourceKind::Restore,
                "r-1",
                ResourceState::Processing,
                json!({}),
            ))
            .await
            .unwrap();

        let selector =
            StateSelector::new(&[ResourceState::Processing, ResourceState::Aborting]);
        let matching = store.list(ResourceKind::Backup, selector).await.unwrap();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].metadata.name, "b-1");
    }

    #[tokio::test]
    async fn watch_filters_by_state() {
        let store = MemoryStore::new();
        let mut rx = store
            .watch(
                ResourceKind::Backup,
                StateSelector::new(&[ResourceState::Processing, ResourceState::Aborting]),
            )
            .await
            .unwrap();

        store.create(&subject("b-1")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, WatchEventType::Added);
        assert_eq!(event.resource.metadata.name, "b-1");

        // terminal transition does not match the selector
        store
            .patch_status(
                ResourceKind::Backup,
                "b-1",
                StatusPatch::new().state(ResourceState::Succeeded),
            )
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_is_observable() {
        let store = MemoryStore::new();
        store.create(&subject("b-1")).await.unwrap();
        store.delete(ResourceKind::Backup, "b-1").await.unwrap();
        let err = store.get(ResourceKind::Backup, "b-1").await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.delete(ResourceKind::Backup, "b-1").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
