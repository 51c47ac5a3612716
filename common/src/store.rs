use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::resource::{Resource, ResourceKind, ResourceState, StateSelector, WatchEvent};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource {kind}/{name} not found")]
    NotFound { kind: ResourceKind, name: String },
    #[error("resource {kind}/{name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },
    #[error("stale version writing {kind}/{name}")]
    Conflict { kind: ResourceKind, name: String },
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(kind: ResourceKind, name: &str) -> Self {
        StoreError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Partial status write. `response` is merged key-by-key over the existing
/// response object, so repeating the same progress patch is idempotent and
/// keys absent from the patch (the abort marker, in particular) survive.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub state: Option<ResourceState>,
    pub response: Option<JsonValue>,
    pub error: Option<JsonValue>,
    /// When set, the write only succeeds if the resource still carries this
    /// version; otherwise the store reports `Conflict`.
    pub expect_version: Option<i64>,
}

impl StatusPatch {
    pub fn new() -> Self {
        StatusPatch::default()
    }

    pub fn state(mut self, state: ResourceState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn response(mut self, response: JsonValue) -> Self {
        self.response = Some(response);
        self
    }

    pub fn error(mut self, error: JsonValue) -> Self {
        self.error = Some(error);
        self
    }

    pub fn expect_version(mut self, version: i64) -> Self {
        self.expect_version = Some(version);
        self
    }

    pub fn apply(&self, resource: &mut Resource) {
        if let Some(state) = self.state {
            resource.status.state = state;
        }
        if let Some(response) = &self.response {
            merge_response(&mut resource.status.response, response);
        }
        if let Some(error) = &self.error {
            resource.status.error = Some(error.clone());
        }
    }
}

/// Top-level object merge; non-object operands degrade to replacement.
pub fn merge_response(existing: &mut JsonValue, patch: &JsonValue) {
    match (existing.as_object_mut(), patch.as_object()) {
        (Some(base), Some(overlay)) => {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
        }
        _ => *existing = patch.clone(),
    }
}

/// CRUD plus watch over versioned resources. Implementations guarantee that
/// `metadata.version` changes on every write and that version-checked writes
/// fail with `Conflict` instead of clobbering newer data.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Resource, StoreError>;

    async fn create(&self, resource: &Resource) -> Result<Resource, StoreError>;

    /// Snapshot of all resources of the kind whose state matches the
    /// selector. Pollers replay this on every watch (re)subscription so
    /// subjects already in flight are discovered, not only ones created
    /// while a watch connection is up.
    async fn list(
        &self,
        kind: ResourceKind,
        selector: StateSelector,
    ) -> Result<Vec<Resource>, StoreError>;

    /// Replaces `spec.options`, bumping the version.
    async fn update_options(
        &self,
        kind: ResourceKind,
        name: &str,
        options: JsonValue,
    ) -> Result<Resource, StoreError>;

    async fn patch_status(
        &self,
        kind: ResourceKind,
        name: &str,
        patch: StatusPatch,
    ) -> Result<Resource, StoreError>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), StoreError>;

    /// Subscribes to changes of the given kind whose state matches the
    /// selector. The returned channel closes when the underlying stream
    /// ends; callers re-subscribe on their own schedule.
    async fn watch(
        &self,
        kind: ResourceKind,
        selector: StateSelector,
    ) -> Result<mpsc::Receiver<WatchEvent>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_keeps_untouched_keys() {
        let mut existing = json!({"abort_started_at": "2024-01-01T00:00:00Z", "stage": "old"});
        merge_response(&mut existing, &json!({"stage": "copying", "progress": 40}));
        assert_eq!(existing["abort_started_at"], "2024-01-01T00:00:00Z");
        assert_eq!(existing["stage"], "copying");
        assert_eq!(existing["progress"], 40);
    }

    #[test]
    fn merge_replaces_non_objects() {
        let mut existing = JsonValue::Null;
        merge_response(&mut existing, &json!({"stage": "s"}));
        assert_eq!(existing["stage"], "s");
    }

    #[test]
    fn patch_applies_in_order() {
        let mut resource = crate::resource::Resource::new(
            ResourceKind::Backup,
            "b-1",
            ResourceState::Processing,
            JsonValue::Null,
        );
        StatusPatch::new()
            .state(ResourceState::Failed)
            .error(json!({"description": "boom"}))
            .apply(&mut resource);
        assert_eq!(resource.status.state, ResourceState::Failed);
        assert_eq!(resource.status.error.unwrap()["description"], "boom");
    }
}
