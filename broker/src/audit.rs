use log::{info, warn};
use serde::Serialize;
use serde_json::Value as JsonValue;

use common::resource::ResourceState;

/// Terminal-outcome notification handed to the observability backend.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub operation: String,
    pub subject_id: String,
    pub instance_guid: String,
    pub state: ResourceState,
    pub payload: JsonValue,
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Writes audit events as structured JSON lines through the log facade.
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => info!(target: "audit", "{line}"),
            Err(e) => warn!(
                "failed to serialize audit event for {} {}: {e}",
                event.operation, event.subject_id
            ),
        }
    }
}
