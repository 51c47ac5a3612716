//! Backup operation state machine.
//!
//! Transitions: `processing -> succeeded | failed`,
//! `processing -> aborting -> aborted | failed`. A backup that outlives its
//! lock-lease TTL is escalated through the agent abort protocol; an abort
//! that itself times out is forced to `aborted` without agent confirmation.
//! Failed scheduled backups are requeued through the external scheduler.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tokio::time::sleep;

use common::resource::{Resource, ResourceKind, ResourceState, StateSelector};
use common::store::{ResourceStore, StatusPatch};
use liblock::{LockManager, Operation};

use crate::agent::{AgentClient, AgentError};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::BackupSettings;
use crate::poller::{PollError, PollerHandle, StatusStrategy};
use crate::schedule::{JobType, ScheduleClient, cron_with_interval_after};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    OnDemand,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Backup,
    Delete,
}

/// Typed view of a backup subject, decoded once per tick from
/// `spec.options` overlaid with `status.response`. A missing required field
/// here is fatal for the subject.
#[derive(Debug, Clone, Deserialize)]
struct BackupRun {
    instance_guid: String,
    backup_guid: String,
    #[allow(dead_code)]
    plan_id: String,
    deployment: String,
    agent_ip: String,
    started_at: DateTime<Utc>,
    #[serde(default = "default_operation_type")]
    operation_type: OperationType,
    #[serde(default = "default_trigger")]
    trigger: Trigger,
    #[serde(default)]
    backup_interval: Option<String>,
    #[serde(default)]
    abort_started_at: Option<DateTime<Utc>>,
}

fn default_operation_type() -> OperationType {
    OperationType::Backup
}

fn default_trigger() -> Trigger {
    Trigger::OnDemand
}

fn decode_run(subject: &Resource) -> Result<BackupRun, serde_json::Error> {
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

pub struct BackupStatusPoller {
    store: Arc<dyn ResourceStore>,
    agent: Arc<dyn AgentClient>,
    locks: Arc<LockManager>,
    scheduler: Arc<dyn ScheduleClient>,
    audit: Arc<dyn AuditSink>,
    settings: BackupSettings,
}

impl BackupStatusPoller {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        agent: Arc<dyn AgentClient>,
        locks: Arc<LockManager>,
        scheduler: Arc<dyn ScheduleClient>,
        audit: Arc<dyn AuditSink>,
        settings: BackupSettings,
    ) -> Self {
        BackupStatusPoller {
            store,
            agent,
            locks,
            scheduler,
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
            "backup subject {} is missing required fields, marking failed: {cause}",
            subject.name()
        );
        let patch_result = self
            .store
            .patch_status(
                ResourceKind::Backup,
                subject.name(),
                StatusPatch::new().state(ResourceState::Failed).error(json!({
                    "status": 400,
                    "description": format!("invalid backup subject: {cause}"),
                })),
            )
            .await;
        // the options may still carry the instance id even when decoding the
        // full run failed; release the lease whenever the subject is known
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

    /// The deployment behind this backup no longer exists. For delete-type
    /// subjects that is the desired end state; everything else failed.
    async fn handle_gone(
        &self,
        subject: &Resource,
        run: &BackupRun,
        handle: &PollerHandle,
    ) -> Result<(), PollError> {
        warn!(
            "deployment {} backing backup {} no longer exists",
            run.deployment, run.backup_guid
        );
        if run.operation_type == OperationType::Delete {
            let delete_result = self
                .store
                .delete(ResourceKind::Backup, subject.name())
                .await;
            if let Err(e) = self.locks.unlock(&run.instance_guid).await {
                error!(
                    "failed to release lock on {} after backup delete: {e}",
                    run.instance_guid
                );
            }
            self.audit.emit(AuditEvent {
                operation: "backup".to_string(),
                subject_id: run.backup_guid.clone(),
                instance_guid: run.instance_guid.clone(),
                state: ResourceState::Succeeded,
                payload: json!({"description": "deployment already gone, backup removed"}),
            });
            handle.clear().await;
            delete_result?;
            Ok(())
        } else {
            self.finalize(
                subject,
                run,
                ResourceState::Failed,
                json!({
                    "description": format!("deployment {} not found", run.deployment),
                }),
                handle,
            )
            .await
        }
    }

    async fn finalize(
        &self,
        subject: &Resource,
        run: &BackupRun,
        outcome: ResourceState,
        response: JsonValue,
        handle: &PollerHandle,
    ) -> Result<(), PollError> {
        info!(
            "backup {} on deployment {} finished: {outcome}",
            run.backup_guid, run.deployment
        );
        let mut patch = StatusPatch::new().state(outcome).response(response.clone());
        if outcome == ResourceState::Failed {
            patch = patch.error(json!({
                "status": 500,
                "description": response
                    .get("description")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("backup failed"),
            }));
        }
        let patch_result = self
            .store
            .patch_status(ResourceKind::Backup, subject.name(), patch)
            .await;
        // lease release is unconditional: it runs even when the terminal
        // patch above failed
        if let Err(e) = self.locks.unlock(&run.instance_guid).await {
            error!(
                "failed to release lock on {} after backup {}: {e}",
                run.instance_guid, run.backup_guid
            );
        }
        self.audit.emit(AuditEvent {
            operation: "backup".to_string(),
            subject_id: run.backup_guid.clone(),
            instance_guid: run.instance_guid.clone(),
            state: outcome,
            payload: response,
        });
        handle.clear().await;
        if outcome == ResourceState::Failed && run.trigger == Trigger::Scheduled {
            self.reschedule(run).await;
        }
        patch_result?;
        Ok(())
    }

    /// Best-effort requeue of a failed scheduled backup; its own failure is
    /// logged, never propagated.
    async fn reschedule(&self, run: &BackupRun) {
        let interval = run.backup_interval.as_deref().unwrap_or("daily");
        let cron = match cron_with_interval_after(
            interval,
            self.settings.reschedule_delay_minutes,
            Utc::now(),
        ) {
            Ok(cron) => cron,
            Err(e) => {
                error!(
                    "cannot derive retry schedule for instance {}: {e}",
                    run.instance_guid
                );
                return;
            }
        };
        info!(
            "requeueing scheduled backup for instance {} with cron {cron}",
            run.instance_guid
        );
        let attempts = self.settings.schedule_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .scheduler
                .schedule(&run.instance_guid, JobType::ScheduledBackup, &cron)
                .await
            {
                Ok(()) => return,
                Err(e) if attempt < attempts => {
                    warn!(
                        "attempt {attempt} to requeue backup for {} failed: {e}",
                        run.instance_guid
                    );
                    sleep(StdDuration::from_millis(
                        self.settings.schedule_retry_delay_millis,
                    ))
                    .await;
                }
                Err(e) => error!(
                    "giving up requeueing backup for {} after {attempts} attempts: {e}",
                    run.instance_guid
                ),
            }
        }
    }
}

#[async_trait]
impl StatusStrategy for BackupStatusPoller {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Backup
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
                return self.handle_gone(&subject, &run, handle).await;
            }
            Err(e) => return Err(e.into()),
        };

        if last_operation.state.is_terminal() {
            let mut response = serde_json::to_value(&last_operation)
                .map_err(|e| PollError::Other(e.into()))?;
            // operation logs go into the final payload, best effort
            match self.agent.get_logs(&run.agent_ip).await {
                Ok(logs) if !logs.is_empty() => {
                    if let Some(map) = response.as_object_mut() {
                        map.insert("logs".to_string(), JsonValue::Array(logs));
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "could not fetch operation logs for backup {}: {e}",
                    run.backup_guid
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
            "backup {} on deployment {} still in progress: {}",
            run.backup_guid, run.deployment, last_operation.stage
        );
        // idempotent progress overwrite; the merge keeps abort_started_at
        let progress =
            serde_json::to_value(&last_operation).map_err(|e| PollError::Other(e.into()))?;
        let current = self
            .store
            .patch_status(
                ResourceKind::Backup,
                subject.name(),
                StatusPatch::new()
                    .response(progress)
                    .expect_version(subject.metadata.version),
            )
            .await?;

        let now = Utc::now();
        let elapsed = now - run.started_at;
        let max_duration = self.locks.lock_ttl(Operation::Backup);
        if elapsed <= max_duration {
            return Ok(());
        }

        match run.abort_started_at {
            None => {
                warn!(
                    "backup {} exceeded {}s on deployment {}, commanding abort",
                    run.backup_guid,
                    max_duration.num_seconds(),
                    run.deployment
                );
                self.agent.abort(&run.agent_ip).await?;
                // the abort marker is set exactly once; only a terminal
                // transition clears it
                self.store
                    .patch_status(
                        ResourceKind::Backup,
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
                        "abort of backup {} still in progress on deployment {}",
                        run.backup_guid, run.deployment
                    );
                    Ok(())
                } else {
                    warn!(
                        "abort of backup {} timed out on deployment {}, forcing aborted",
                        run.backup_guid, run.deployment
                    );
                    self.finalize(
                        &subject,
                        &run,
                        ResourceState::Aborted,
                        json!({
                            "description": format!(
                                "backup {} aborted after abort timeout", run.backup_guid
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
