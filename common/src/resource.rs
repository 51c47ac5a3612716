use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const API_VERSION: &str = "broker.servicefabrik.io/v1alpha1";

/// Resource kinds tracked in the store. Operation subjects are `Backup`,
/// `Restore` and `Deployment`; `Lock` is the lease kind consumed by liblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Backup,
    Restore,
    Deployment,
    Lock,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Backup => "backup",
            ResourceKind::Restore => "restore",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Lock => "lock",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    InQueue,
    InProgress,
    Update,
    Delete,
    Processing,
    Aborting,
    Succeeded,
    Failed,
    Aborted,
    DeleteFailed,
}

impl ResourceState {
    /// Terminal states are never left again; only audit/cleanup touches a
    /// subject after it reaches one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceState::Succeeded
                | ResourceState::Failed
                | ResourceState::Aborted
                | ResourceState::DeleteFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::InQueue => "in_queue",
            ResourceState::InProgress => "in_progress",
            ResourceState::Update => "update",
            ResourceState::Delete => "delete",
            ResourceState::Processing => "processing",
            ResourceState::Aborting => "aborting",
            ResourceState::Succeeded => "succeeded",
            ResourceState::Failed => "failed",
            ResourceState::Aborted => "aborted",
            ResourceState::DeleteFailed => "delete_failed",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State-membership predicate used for watch filtering,
/// e.g. `state in (processing,aborting)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSelector {
    states: Vec<ResourceState>,
}

impl StateSelector {
    pub fn new(states: &[ResourceState]) -> Self {
        Self {
            states: states.to_vec(),
        }
    }

    pub fn matches(&self, state: ResourceState) -> bool {
        self.states.contains(&state)
    }

    pub fn states(&self) -> &[ResourceState] {
        &self.states
    }
}

impl fmt::Display for StateSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .states
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "state in ({joined})")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    /// Optimistic-concurrency token; bumped by the store on every write.
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    /// Operation parameters as handed over by the API layer. Decoded into a
    /// typed struct at the state machine boundary, never inspected raw.
    #[serde(default)]
    pub options: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: ResourceState,
    #[serde(default)]
    pub response: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            state: ResourceState::InQueue,
            response: JsonValue::Null,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: Metadata,
    pub spec: Spec,
    pub status: Status,
}

impl Resource {
    pub fn new(kind: ResourceKind, name: &str, state: ResourceState, options: JsonValue) -> Self {
        Resource {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: Metadata {
                name: name.to_string(),
                version: 0,
                annotations: BTreeMap::new(),
            },
            spec: Spec { options },
            status: Status {
                state,
                response: JsonValue::Null,
                error: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Store-delivered notification about a resource change. Delivery is
/// at-least-once and may be duplicated; consumers must tolerate redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub resource: Resource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        let s = serde_json::to_string(&ResourceState::InProgress).unwrap();
        assert_eq!(s, "\"in_progress\"");
        let s = serde_json::to_string(&ResourceState::DeleteFailed).unwrap();
        assert_eq!(s, "\"delete_failed\"");
        let back: ResourceState = serde_json::from_str("\"aborting\"").unwrap();
        assert_eq!(back, ResourceState::Aborting);
    }

    #[test]
    fn terminal_states() {
        for state in [
            ResourceState::Succeeded,
            ResourceState::Failed,
            ResourceState::Aborted,
            ResourceState::DeleteFailed,
        ] {
            assert!(state.is_terminal(), "{state} should be terminal");
        }
        for state in [
            ResourceState::InQueue,
            ResourceState::InProgress,
            ResourceState::Processing,
            ResourceState::Aborting,
            ResourceState::Delete,
        ] {
            assert!(!state.is_terminal(), "{state} should not be terminal");
        }
    }

    #[test]
    fn selector_display_and_matching() {
        let selector =
            StateSelector::new(&[ResourceState::Processing, ResourceState::Aborting]);
        assert_eq!(selector.to_string(), "state in (processing,aborting)");
        assert!(selector.matches(ResourceState::Processing));
        assert!(!selector.matches(ResourceState::Succeeded));
    }

    #[test]
    fn resource_round_trips_through_json() {
        let resource = Resource::new(
            ResourceKind::Backup,
            "b-42",
            ResourceState::Processing,
            serde_json::json!({"instance_guid": "i-1"}),
        );
        let body = serde_json::to_string(&resource).unwrap();
        let back: Resource = serde_json::from_str(&body).unwrap();
        assert_eq!(back.metadata.name, "b-42");
        assert_eq!(back.kind, ResourceKind::Backup);
        assert_eq!(back.status.state, ResourceState::Processing);
    }
}
