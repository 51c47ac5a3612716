//! Restore operation state machine.
//!
//! Shares the backup machine's escalation shape (overdue restore is aborted,
//! stuck abort is forced) but differs at the edges: restores are never
//! rescheduled, and a vanished deployment always means failure since there is
//! no delete-flavoured restore.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use common::resource::{Resource, ResourceKind, ResourceState, StateSelector};
use common::store::{ResourceStore, StatusPatch};
use liblock::{LockManager, Operation};

use crate::agent::{AgentClient, AgentError};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::RestoreSettings;
use crate::poller::{PollError, PollerHandle, StatusStrategy};

#[derive(Debug, Clone, Deserialize)]
struct RestoreRun {
    instance_guid: String,
    restore_guid: String,
    /// The backup being restored from.
    #[allow(dead_code)]
    backup_guid: String,
    deployment: String,
    agent_ip: String,
    started_at: DateTime<Utc>,
    #[serde(default)]
    abort_started_at: Option<DateTime<Utc>>,
}

fn decode_run(subject: &Resource) -> Result<RestoreRun, serde_json::Error> {
    let mut doc = subject.spec.options.clone();
    if let (Some(base), Some(overlay)) =
        (doc.as_object_mut(), subject.status.response.as_object())
    {
        for (key, value) in overlay {
            base.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(doc)
}

pub struct RestoreStatusPoller {
    store: Arc<dyn ResourceStore>,
    agent: Arc<dyn AgentClient>,
    locks: Arc<LockManager>,
    audit: Arc<dyn AuditSink>,
    settings: RestoreSettings,
}

impl RestoreStatusPoller {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        agent: Arc<dyn AgentClient>,
        locks: Arc<LockManager>,
        audit: Arc<dyn AuditSink>,
        settings: RestoreSettings,
    ) -> Self {
        RestoreStatusPoller {
            store,
            agent,
            locks,
            audit,
            settings,
        }
    }

    async fn fail_validation(
        &self,
        subject: &Resource,
        handle: &PollerHandle,
        cause: serde_json::Error,
    ) -> Result<(), PollError> {
        error!(
            "restore subject {} is missing required fields, marking failed: {cause}",
            subject.name()
        );
        let patch_result = self
            .store
            .patch_status(
                ResourceKind::Restore,
                subject.name(),
                StatusPatch::new().state(ResourceState::Failed).error(json!({
                    "status": 400,
                    "description": format!("invalid restore subject: {cause}"),
                })),
            )
            .await;
        if let Some(instance) = subject
            .spec
            .options
            .get("instance_guid")
            .and_then(JsonValue::as_str)
        {
            if let Err(e) = self.locks.unlock(instance).await {
                error!("failed to release lock on {instance}: {e}");
            }
        }
        handle.clear().await;
        patch_result?;
        Ok(())
    }

    async fn finalize(
        &self,
        subject: &Resource,
        run: &RestoreRun,
        outcome: ResourceState,
        response: JsonValue,
        handle: &PollerHandle,
    ) -> Result<(), PollError> {
        info!(
            "restore {} on deployment {} finished: {outcome}",
            run.restore_guid, run.deployment
        );
        let mut patch = StatusPatch::new().state(outcome).response(response.clone());
        if outcome == ResourceState::Failed {
            patch = patch.error(json!({
                "status": 500,
                "description": response
                    .get("description")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("restore failed"),
            }));
        }
        let patch_result = self
            .store
            .patch_status(ResourceKind::Restore, subject.name(), patch)
            .await;
        if let Err(e) = self.locks.unlock(&run.instance_guid).await {
            error!(
                "failed to release lock on {} after restore {}: {e}",
                run.instance_guid, run.restore_guid
            );
        }
        self.audit.emit(AuditEvent {
            operation: "restore".to_string(),
            subject_id: run.restore_guid.clone(),
            instance_guid: run.instance_guid.clone(),
            state: outcome,
            payload: response,
        });
        handle.clear().await;
        patch_result?;
        Ok(())
    }
}

#[async_trait]
impl StatusStrategy for RestoreStatusPoller {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Restore
    }

    fn valid_states(&self) -> StateSelector {
        StateSelector::new(&[ResourceState::Processing, ResourceState::Aborting])
    }

    fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.settings.status_check_interval_secs)
    }

    async fn get_status(
        &self,
        subject: Resource,
        handle: &PollerHandle,
    ) -> Result<(), PollError> {
        let run = match decode_run(&subject) {
            Ok(run) => run,
            Err(cause) => return self.fail_validation(&subject, handle, cause).await,
        };

        let last_operation = match self.agent.get_last_operation(&run.agent_ip).await {
            Ok(op) => op,
            Err(AgentError::NotFound(_)) => {
                warn!(
                    "deployment {} backing restore {} no longer exists",
                    run.deployment, run.restore_guid
                );
                return self
                    .finalize(
                        &subject,
                        &run,
                        ResourceState::Failed,
                        json!({
                            "description": format!("deployment {} not found", run.deployment),
                        }),
                        handle,
                    )
                    .await;
            }
            Err(e) => return Err(e.into()),
        };

        if last_operation.state.is_terminal() {
            let mut response = serde_json::to_value(&last_operation)
                .map_err(|e| PollError::Other(e.into()))?;
            match self.agent.get_logs(&run.agent_ip).await {
                Ok(logs) if !logs.is_empty() => {
                    if let Some(map) = response.as_object_mut() {
                        map.insert("logs".to_string(), JsonValue::Array(logs));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "could not fetch operation logs for restore {}: {e}",
                    run.restore_guid
                ),
            }
            return self
                .finalize(
                    &subject,
                    &run,
                    last_operation.state.into_resource_state(),
                    response,
                    handle,
                )
                .await;
        }

        info!(
            "restore {} on deployment {} still in progress: {}",
            run.restore_guid, run.deployment, last_operation.stage
        );
        let progress =
            serde_json::to_value(&last_operation).map_err(|e| PollError::Other(e.into()))?;
        let current = self
            .store
            .patch_status(
                ResourceKind::Restore,
                subject.name(),
                StatusPatch::new()
                    .response(progress)
                    .expect_version(subject.metadata.version),
            )
            .await?;

        let now = Utc::now();
        let elapsed = now - run.started_at;
        let max_duration = self.locks.lock_ttl(Operation::Restore);
        if elapsed <= max_duration {
            return Ok(());
        }

        match run.abort_started_at {
            None => {
                warn!(
                    "restore {} exceeded {}s on deployment {}, commanding abort",
                    run.restore_guid,
                    max_duration.num_seconds(),
                    run.deployment
                );
                self.agent.abort(&run.agent_ip).await?;
                self.store
                    .patch_status(
                        ResourceKind::Restore,
                        subject.name(),
                        StatusPatch::new()
                            .state(ResourceState::Aborting)
                            .response(json!({"abort_started_at": now}))
                            .expect_version(current.metadata.version),
                    )
                    .await?;
                Ok(())
            }
            Some(abort_started_at) => {
                let abort_elapsed = now - abort_started_at;
                if abort_elapsed < chrono::Duration::seconds(self.settings.abort_timeout_secs) {
                    info!(
                        "abort of restore {} still in progress on deployment {}",
                        run.restore_guid, run.deployment
                    );
                    Ok(())
                } else {
                    warn!(
                        "abort of restore {} timed out on deployment {}, forcing aborted",
                        run.restore_guid, run.deployment
                    );
                    self.finalize(
                        &subject,
                        &run,
                        ResourceState::Aborted,
                        json!({
                            "description": format!(
                                "restore {} aborted after abort timeout", run.restore_guid
                            ),
                        }),
                        handle,
                    )
                    .await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOperationState;
    use crate::poller::PollerRegistry;
    use crate::poller::testutil::{FakeAgent, RecordingAudit, handle_for};
    use common::memory::MemoryStore;
    use liblock::LockConfig;

    struct Fixture {
        store: Arc<MemoryStore>,
        agent: Arc<FakeAgent>,
        locks: Arc<LockManager>,
        audit: Arc<RecordingAudit>,
        registry: PollerRegistry,
        poller: RestoreStatusPoller,
    }

    fn fixture(agent: Arc<FakeAgent>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockManager::new(
            store.clone(),
            LockConfig {
                restore_ttl: chrono::Duration::seconds(3600),
                unlock_retry_delay: StdDuration::from_millis(1),
                ..LockConfig::default()
            },
        ));
        let audit = Arc::new(RecordingAudit::default());
        let poller = RestoreStatusPoller::new(
            store.clone(),
            agent.clone(),
            locks.clone(),
            audit.clone(),
            RestoreSettings::default(),
        );
        Fixture {
            store,
            agent,
            locks,
            audit,
            registry: PollerRegistry::new(),
            poller,
        }
    }

    fn options(started_secs_ago: i64) -> JsonValue {
        json!({
            "instance_guid": "i-1",
            "restore_guid": "r-1",
            "backup_guid": "b-1",
            "deployment": "service-instance-i-1",
            "agent_ip": "10.0.0.5",
            "started_at": Utc::now() - chrono::Duration::seconds(started_secs_ago),
        })
    }

    async fn seed(fx: &Fixture, options: JsonValue) -> Resource {
        let resource = Resource::new(
            ResourceKind::Restore,
            "r-1",
            ResourceState::Processing,
            options,
        );
        let created = fx.store.create(&resource).await.unwrap();
        fx.locks.lock("i-1", Operation::Restore).await.unwrap();
        created
    }

    async fn run_tick(fx: &Fixture) -> Result<(), PollError> {
        let handle = handle_for(&fx.registry, "r-1").await;
        let subject = fx.store.get(ResourceKind::Restore, "r-1").await.unwrap();
        fx.poller.get_status(subject, &handle).await
    }

    #[tokio::test]
    async fn succeeded_restore_finalizes_and_releases_lease() {
        let fx = fixture(FakeAgent::finished(AgentOperationState::Succeeded));
        seed(&fx, options(60)).await;

        run_tick(&fx).await.unwrap();

        let subject = fx.store.get(ResourceKind::Restore, "r-1").await.unwrap();
        assert_eq!(subject.status.state, ResourceState::Succeeded);
        assert!(!fx.locks.status("i-1").await.unwrap().locked);
        assert_eq!(fx.registry.active_count().await, 0);

        let events = fx.audit.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "restore");
        assert_eq!(events[0].subject_id, "r-1");
    }

    #[tokio::test]
    async fn in_progress_restore_keeps_polling() {
        let fx = fixture(FakeAgent::processing("downloading"));
        seed(&fx, options(60)).await;

        run_tick(&fx).await.unwrap();

        let subject = fx.store.get(ResourceKind::Restore, "r-1").await.unwrap();
        assert_eq!(subject.status.state, ResourceState::Processing);
        assert_eq!(subject.status.response["stage"], "downloading");
        assert!(fx.locks.status("i-1").await.unwrap().locked);
        assert_eq!(fx.registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn overdue_restore_escalates_to_abort() {
        let fx = fixture(FakeAgent::processing("downloading"));
        seed(&fx, options(3601)).await;

        run_tick(&fx).await.unwrap();

        let subject = fx.store.get(ResourceKind::Restore, "r-1").await.unwrap();
        assert_eq!(subject.status.state, ResourceState::Aborting);
        assert!(subject.status.response["abort_started_at"].is_string());
        assert_eq!(fx.agent.aborts.lock().await.as_slice(), ["10.0.0.5"]);
        assert!(fx.locks.status("i-1").await.unwrap().locked);
    }

    #[tokio::test]
    async fn stuck_abort_is_forced_to_aborted() {
        let fx = fixture(FakeAgent::processing("stuck"));
        let mut opts = options(4000);
        opts["abort_started_at"] =
            json!(Utc::now() - chrono::Duration::seconds(301));
        seed(&fx, opts).await;

        run_tick(&fx).await.unwrap();

        let subject = fx.store.get(ResourceKind::Restore, "r-1").await.unwrap();
        assert_eq!(subject.status.state, ResourceState::Aborted);
        assert!(!fx.locks.status("i-1").await.unwrap().locked);
        assert!(fx.agent.aborts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn gone_deployment_always_fails_restore() {
        let fx = fixture(FakeAgent::gone());
        seed(&fx, options(60)).await;

        run_tick(&fx).await.unwrap();

        let subject = fx.store.get(ResourceKind::Restore, "r-1").await.unwrap();
        assert_eq!(subject.status.state, ResourceState::Failed);
        assert!(!fx.locks.status("i-1").await.unwrap().locked);
        assert_eq!(fx.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn missing_required_field_is_fatal() {
        let fx = fixture(FakeAgent::processing("unused"));
        let mut opts = options(60);
        opts.as_object_mut().unwrap().remove("restore_guid");
        seed(&fx, opts).await;

        run_tick(&fx).await.unwrap();

        let subject = fx.store.get(ResourceKind::Restore, "r-1").await.unwrap();
        assert_eq!(subject.status.state, ResourceState::Failed);
        assert_eq!(subject.status.error.as_ref().unwrap()["status"], 400);
        assert!(!fx.locks.status("i-1").await.unwrap().locked);
    }
}
