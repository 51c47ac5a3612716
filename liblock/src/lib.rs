//! Per-subject mutual-exclusion leases backed by a dedicated resource kind.
//!
//! A lease must exist for the full duration between operation start and the
//! terminal state transition, and must be released exactly once on every
//! exit path. `unlock` is idempotent so finalization code can call it
//! unconditionally.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use common::resource::{Resource, ResourceKind, ResourceState};
use common::store::{ResourceStore, StoreError};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("subject {subject} already locked for {operation} since {acquired_at}")]
    AlreadyLocked {
        subject: String,
        operation: String,
        acquired_at: DateTime<Utc>,
    },
    #[error("malformed lease on subject {subject}: {reason}")]
    MalformedLease { subject: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
        }
    }
}

/// Wire format of `spec.options` on a lease resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDetails {
    pub locked_resource_details: LockedResourceDetails,
    pub lock_time: DateTime<Utc>,
    /// TTL in seconds.
    #[serde(rename = "lockTTL")]
    pub lock_ttl: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedResourceDetails {
    pub operation: String,
}

impl LockDetails {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.lock_time >= Duration::seconds(self.lock_ttl)
    }
}

#[derive(Debug, Clone)]
pub struct LockStatus {
    pub locked: bool,
    pub details: Option<LockDetails>,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub backup_ttl: Duration,
    pub restore_ttl: Duration,
    pub unlock_max_retries: u32,
    pub unlock_retry_delay: StdDuration,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            backup_ttl: Duration::seconds(14400),
            restore_ttl: Duration::seconds(14400),
            unlock_max_retries: 3,
            unlock_retry_delay: StdDuration::from_millis(500),
        }
    }
}

pub struct LockManager {
    store: Arc<dyn ResourceStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn ResourceStore>, config: LockConfig) -> Self {
        LockManager { store, config }
    }

    /// The per-operation-type lease TTL. State machines use this as the
    /// maximum allowed operation duration before abort escalation.
    pub fn lock_ttl(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Backup => self.config.backup_ttl,
            Operation::Restore => self.config.restore_ttl,
        }
    }

    /// Acquires the lease for `subject`, failing with `AlreadyLocked` when an
    /// unexpired lease exists. An expired lease is taken over in place.
    pub async fn lock(&self, subject: &str, operation: Operation) -> Result<(), LockError> {
        let now = Utc::now();
        let details = LockDetails {
            locked_resource_details: LockedResourceDetails {
                operation: operation.as_str().to_string(),
            },
            lock_time: now,
            lock_ttl: self.lock_ttl(operation).num_seconds(),
        };
        let options = serde_json::to_value(&details).map_err(|e| LockError::MalformedLease {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;
        info!("attempting to acquire lock on subject {subject} for {}", operation.as_str());

        match self.store.get(ResourceKind::Lock, subject).await {
            Ok(existing) => {
                let current = parse_details(subject, &existing)?;
                if !current.is_expired(now) {
                    return Err(already_locked(subject, &current));
                }
                // expired lease left behind by a crashed holder: take it over
                match self
                    .store
                    .update_options(ResourceKind::Lock, subject, options)
                    .await
                {
                    Ok(_) => {
                        info!("took over expired lock on subject {subject}");
                        Ok(())
                    }
                    Err(StoreError::Conflict { .. }) => Err(self.lost_race(subject).await),
                    Err(e) => Err(e.into()),
                }
            }
            Err(StoreError::NotFound { .. }) => {
                let lease = Resource::new(
                    ResourceKind::Lock,
                    subject,
                    ResourceState::InProgress,
                    options,
                );
                match self.store.create(&lease).await {
                    Ok(_) => {
                        info!("acquired lock on subject {subject} for {}", operation.as_str());
                        Ok(())
                    }
                    Err(StoreError::AlreadyExists { .. }) => Err(self.lost_race(subject).await),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-only inspection used by the API layer to reject new operations
    /// against a locked subject. An expired lease reports unlocked.
    pub async fn status(&self, subject: &str) -> Result<LockStatus, LockError> {
        match self.store.get(ResourceKind::Lock, subject).await {
            Ok(resource) => {
                let details = parse_details(subject, &resource)?;
                if details.is_expired(Utc::now()) {
                    Ok(LockStatus {
                        locked: false,
                        details: None,
                    })
                } else {
                    Ok(LockStatus {
                        locked: true,
                        details: Some(details),
                    })
                }
            }
            Err(StoreError::NotFound { .. }) => Ok(LockStatus {
                locked: false,
                details: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lease. Releasing an already-released or nonexistent
    /// lease is not an error; transient store failures are retried a bounded
    /// number of times.
    pub async fn unlock(&self, subject: &str) -> Result<(), LockError> {
        let mut last_err = None;
        for attempt in 1..=self.config.unlock_max_retries {
            match self.store.delete(ResourceKind::Lock, subject).await {
                Ok(()) => {
                    info!("released lock on subject {subject}");
                    return Ok(());
                }
                Err(StoreError::NotFound { .. }) => {
                    info!("lock on subject {subject} already released");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "attempt {attempt} to release lock on subject {subject} failed: {e}"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(self.config.unlock_retry_delay).await;
                }
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn lost_race(&self, subject: &str) -> LockError {
        match self.store.get(ResourceKind::Lock, subject).await {
            Ok(resource) => match parse_details(subject, &resource) {
                Ok(details) => already_locked(subject, &details),
                Err(e) => e,
            },
            Err(e) => e.into(),
        }
    }
}

fn already_locked(subject: &str, details: &LockDetails) -> LockError {
    LockError::AlreadyLocked {
        subject: subject.to_string(),
        operation: details.locked_resource_details.operation.clone(),
        acquired_at: details.lock_time,
    }
}

fn parse_details(subject: &str, resource: &Resource) -> Result<LockDetails, LockError> {
    serde_json::from_value(resource.spec.options.clone()).map_err(|e| LockError::MalformedLease {
        subject: subject.to_string(),
        reason: e.to_string(),
    })
}
