//! Generic watch-driven status poller.
//!
//! A `StatusPoller` subscribes to the resource store's watch stream for one
//! `(kind, states)` filter and keeps exactly one recurring poll task per
//! matching subject. Watch events are at-least-once and may be redelivered;
//! the registration map is the single source of truth for whether a subject
//! already has an active poller.

pub mod backup;
pub mod restore;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;

use common::resource::{Resource, ResourceKind, StateSelector, WatchEvent, WatchEventType};
use common::store::{ResourceStore, StoreError};

use crate::agent::AgentError;
use crate::config::WatchConfig;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PollError {
    /// Stale-version write conflicts are retryable: the next tick re-reads
    /// current state. Everything else escaping a strategy is fatal for the
    /// subject's poller.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PollError::Store(e) if e.is_conflict())
    }
}

/// Per-subject status-check logic plugged into a `StatusPoller`.
#[async_trait]
pub trait StatusStrategy: Send + Sync + 'static {
    fn kind(&self) -> ResourceKind;

    fn valid_states(&self) -> StateSelector;

    fn poll_interval(&self) -> Duration;

    /// Invoked once per tick with a freshly read subject. The strategy
    /// patches subject status itself and requests cancellation through the
    /// handle at terminal outcomes.
    async fn get_status(&self, subject: Resource, handle: &PollerHandle)
    -> Result<(), PollError>;
}

struct Registration {
    token: u64,
    cancel: CancellationToken,
}

/// `subject id -> registration` map. At most one active registration per
/// subject at any time; guarded against concurrent mutation from the watch
/// loop and from tick completion.
#[derive(Clone)]
pub struct PollerRegistry {
    inner: Arc<Mutex<HashMap<String, Registration>>>,
    next_token: Arc<AtomicU64>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        PollerRegistry {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Claims the subject if no active registration exists. Returns `None`
    /// when a poller is already active, which makes redelivered watch events
    /// a no-op.
    pub(crate) async fn register(&self, subject_id: &str) -> Option<(u64, CancellationToken)> {
        let mut map = self.inner.lock().await;
        if map.contains_key(subject_id) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        map.insert(
            subject_id.to_string(),
            Registration {
                token,
                cancel: cancel.clone(),
            },
        );
        Some((token, cancel))
    }

    /// Idempotent cancellation. A second call, or a call with a stale token
    /// from an already-replaced registration, is a no-op. This guards
    /// against a slow tick finishing after a newer registration took over
    /// the subject.
    pub async fn clear(&self, subject_id: &str, token: u64) {
        let mut map = self.inner.lock().await;
        match map.get(subject_id) {
            Some(registration) if registration.token == token => {
                debug!("clearing status poller for subject {subject_id}");
                registration.cancel.cancel();
                map.remove(subject_id);
            }
            _ => debug!("stale poller clear for subject {subject_id}, ignoring"),
        }
    }

    pub async fn is_active(&self, subject_id: &str, token: u64) -> bool {
        let map = self.inner.lock().await;
        map.get(subject_id)
            .map(|registration| registration.token == token)
            .unwrap_or(false)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for PollerRegistry {
    fn default() -> Self {
        PollerRegistry::new()
    }
}

/// Handed to strategies so they can cancel their own poller on terminal
/// outcomes. Safe to use from within the tick that is finalizing.
#[derive(Clone)]
pub struct PollerHandle {
    pub subject_id: String,
    pub(crate) token: u64,
    pub(crate) registry: PollerRegistry,
}

impl PollerHandle {
    pub async fn clear(&self) {
        self.registry.clear(&self.subject_id, self.token).await;
    }
}

pub struct StatusPoller {
    store: Arc<dyn ResourceStore>,
    strategy: Arc<dyn StatusStrategy>,
    registry: PollerRegistry,
    watch: WatchConfig,
}

impl StatusPoller {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        strategy: Arc<dyn StatusStrategy>,
        watch: WatchConfig,
    ) -> Self {
        StatusPoller {
            store,
            strategy,
            registry: PollerRegistry::new(),
            watch,
        }
    }

    pub fn registry(&self) -> &PollerRegistry {
        &self.registry
    }

    /// Runs the watch loop until the task is dropped. Each watch connection
    /// lives at most `refresh_interval_secs`; re-subscription cannot create
    /// duplicate pollers because the registry check is the single source of
    /// truth.
    pub fn start(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let strategy = self.strategy.clone();
        let registry = self.registry.clone();
        let refresh = Duration::from_secs(self.watch.refresh_interval_secs);
        let error_delay = Duration::from_secs(self.watch.error_delay_secs);

        tokio::spawn(async move {
            loop {
                let selector = strategy.valid_states();
                let mut stream = match store.watch(strategy.kind(), selector.clone()).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(
                            "failed to establish watch on {} resources: {e}",
                            strategy.kind()
                        );
                        sleep(error_delay).await;
                        continue;
                    }
                };
                info!(
                    "watching {} resources with filter {selector}",
                    strategy.kind()
                );
                // watch first, then snapshot: a subject already in flight at
                // (re)subscription gets its poller from the snapshot, and
                // any event raced during it is deduped by the registry
                match store.list(strategy.kind(), selector.clone()).await {
                    Ok(subjects) => {
                        for subject in &subjects {
                            ensure_poller(&store, &strategy, &registry, subject.name()).await;
                        }
                    }
                    Err(e) => warn!(
                        "failed to list in-flight {} resources: {e}",
                        strategy.kind()
                    ),
                }
                let deadline = sleep(refresh);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => {
                            debug!("refreshing {} watch stream", strategy.kind());
                            break;
                        }
                        event = stream.recv() => match event {
                            Some(event) => {
                                handle_event(&store, &strategy, &registry, event).await;
                            }
                            None => {
                                warn!("{} watch stream closed, resubscribing", strategy.kind());
                                sleep(error_delay).await;
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

pub(crate) async fn handle_event(
    store: &Arc<dyn ResourceStore>,
    strategy: &Arc<dyn StatusStrategy>,
    registry: &PollerRegistry,
    event: WatchEvent,
) {
    if !matches!(
        event.event_type,
        WatchEventType::Added | WatchEventType::Modified
    ) {
        return;
    }
    if !strategy.valid_states().matches(event.resource.status.state) {
        return;
    }
    ensure_poller(store, strategy, registry, event.resource.name()).await;
}

pub(crate) async fn ensure_poller(
    store: &Arc<dyn ResourceStore>,
    strategy: &Arc<dyn StatusStrategy>,
    registry: &PollerRegistry,
    subject_id: &str,
) {
    let Some((token, cancel)) = registry.register(subject_id).await else {
        debug!("poller already active for subject {subject_id}");
        return;
    };
    info!(
        "starting status poller for {} subject {subject_id}",
        strategy.kind()
    );
    let handle = PollerHandle {
        subject_id: subject_id.to_string(),
        token,
        registry: registry.clone(),
    };
    let store = store.clone();
    let strategy = strategy.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(strategy.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the zeroth tick completes immediately; skip it so the first poll
        // lands one full interval after registration
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // the tick body runs inline in this task, so two ticks
                    // for the same subject can never overlap
                    poll_subject(&store, &strategy, &handle).await;
                    if !handle.registry.is_active(&handle.subject_id, handle.token).await {
                        break;
                    }
                }
            }
        }
        debug!("status poller stopped for subject {}", handle.subject_id);
    });
}

async fn poll_subject(
    store: &Arc<dyn ResourceStore>,
    strategy: &Arc<dyn StatusStrategy>,
    handle: &PollerHandle,
) {
    let subject = match store.get(strategy.kind(), &handle.subject_id).await {
        Ok(subject) => subject,
        Err(StoreError::NotFound { .. }) => {
            info!(
                "subject {} is gone, clearing poller",
                handle.subject_id
            );
            handle.clear().await;
            return;
        }
        Err(e) => {
            warn!("failed to read subject {}: {e}", handle.subject_id);
            return;
        }
    };
    if !strategy.valid_states().matches(subject.status.state) {
        debug!(
            "subject {} left polled states (now {}), clearing poller",
            handle.subject_id, subject.status.state
        );
        handle.clear().await;
        return;
    }
    if let Err(e) = strategy.get_status(subject, handle).await {
        if e.is_conflict() {
            warn!(
                "stale write on subject {}, re-reading on next tick: {e}",
                handle.subject_id
            );
        } else {
            error!(
                "status check for subject {} failed, clearing poller: {e}",
                handle.subject_id
            );
            handle.clear().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use common::memory::MemoryStore;
    use common::resource::{
        Resource, ResourceKind, ResourceState, StateSelector, WatchEvent, WatchEventType,
    };
    use common::store::{ResourceStore, StatusPatch};

    use super::*;

    struct CountingStrategy {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StatusStrategy for CountingStrategy {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Backup
        }

        fn valid_states(&self) -> StateSelector {
            StateSelector::new(&[ResourceState::Processing, ResourceState::Aborting])
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn get_status(
            &self,
            _subject: Resource,
            _handle: &PollerHandle,
        ) -> Result<(), PollError> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn subject(name: &str) -> Resource {
        Resource::new(
            ResourceKind::Backup,
            name,
            ResourceState::Processing,
            json!({}),
        )
    }

    fn added(resource: &Resource) -> WatchEvent {
        WatchEvent {
            event_type: WatchEventType::Added,
            resource: resource.clone(),
        }
    }

    #[tokio::test]
    async fn duplicate_events_start_one_poller() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let strategy: Arc<dyn StatusStrategy> = Arc::new(CountingStrategy {
            ticks: Arc::new(AtomicUsize::new(0)),
        });
        let registry = PollerRegistry::new();
        let resource = subject("b-1");
        store.create(&resource).await.unwrap();

        for _ in 0..5 {
            handle_event(&store, &strategy, &registry, added(&resource)).await;
        }
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn events_for_other_states_are_ignored() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let strategy: Arc<dyn StatusStrategy> = Arc::new(CountingStrategy {
            ticks: Arc::new(AtomicUsize::new(0)),
        });
        let registry = PollerRegistry::new();
        let mut resource = subject("b-1");
        resource.status.state = ResourceState::Succeeded;

        handle_event(&store, &strategy, &registry, added(&resource)).await;
        assert_eq!(registry.active_count().await, 0);

        let deleted = WatchEvent {
            event_type: WatchEventType::Deleted,
            resource: subject("b-2"),
        };
        handle_event(&store, &strategy, &registry, deleted).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn clear_is_idempotent_and_token_checked() {
        let registry = PollerRegistry::new();
        let (first_token, _cancel) = registry.register("b-1").await.unwrap();

        registry.clear("b-1", first_token).await;
        assert_eq!(registry.active_count().await, 0);
        // second clear with the same token is a no-op
        registry.clear("b-1", first_token).await;

        // a newer registration must not be cancelled by the stale token
        let (second_token, _cancel) = registry.register("b-1").await.unwrap();
        registry.clear("b-1", first_token).await;
        assert!(registry.is_active("b-1", second_token).await);
        registry.clear("b-1", second_token).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn poller_stops_when_subject_leaves_polled_states() {
        let memory = MemoryStore::new();
        let store: Arc<dyn ResourceStore> = Arc::new(memory.clone());
        let ticks = Arc::new(AtomicUsize::new(0));
        let strategy: Arc<dyn StatusStrategy> = Arc::new(CountingStrategy {
            ticks: ticks.clone(),
        });
        let registry = PollerRegistry::new();
        store.create(&subject("b-1")).await.unwrap();

        ensure_poller(&store, &strategy, &registry, "b-1").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);

        memory
            .patch_status(
                ResourceKind::Backup,
                "b-1",
                StatusPatch::new().state(ResourceState::Succeeded),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.active_count().await, 0);

        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    struct FailingStrategy {
        conflict: bool,
    }

    #[async_trait]
    impl StatusStrategy for FailingStrategy {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Backup
        }

        fn valid_states(&self) -> StateSelector {
            StateSelector::new(&[ResourceState::Processing])
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn get_status(
            &self,
            subject: Resource,
            _handle: &PollerHandle,
        ) -> Result<(), PollError> {
            if self.conflict {
                Err(PollError::Store(StoreError::Conflict {
                    kind: ResourceKind::Backup,
                    name: subject.name().to_string(),
                }))
            } else {
                Err(PollError::Other(anyhow::anyhow!("agent unreachable")))
            }
        }
    }

    #[tokio::test]
    async fn in_flight_subject_discovered_on_start() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        // subject entered processing before the poller came up
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

        let poller = StatusPoller::new(
            store.clone(),
            Arc::new(CountingStrategy {
                ticks: Arc::new(AtomicUsize::new(0)),
            }),
            WatchConfig {
                refresh_interval_secs: 60,
                error_delay_secs: 1,
            },
        );
        let task = poller.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the one registration is b-1's: a duplicate claim is refused
        assert!(poller.registry().register("b-1").await.is_none());
        assert_eq!(poller.registry().active_count().await, 1);
        task.abort();
    }

    #[tokio::test]
    async fn conflict_in_tick_keeps_poller_alive() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let strategy: Arc<dyn StatusStrategy> = Arc::new(FailingStrategy { conflict: true });
        let registry = PollerRegistry::new();
        store.create(&subject("b-1")).await.unwrap();

        let (token, _cancel) = registry.register("b-1").await.unwrap();
        let handle = PollerHandle {
            subject_id: "b-1".to_string(),
            token,
            registry: registry.clone(),
        };
        poll_subject(&store, &strategy, &handle).await;
        // next tick will re-read fresh state
        assert!(registry.is_active("b-1", token).await);
    }

    #[tokio::test]
    async fn fatal_tick_error_clears_poller() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let strategy: Arc<dyn StatusStrategy> = Arc::new(FailingStrategy { conflict: false });
        let registry = PollerRegistry::new();
        store.create(&subject("b-1")).await.unwrap();

        let (token, _cancel) = registry.register("b-1").await.unwrap();
        let handle = PollerHandle {
            subject_id: "b-1".to_string(),
            token,
            registry: registry.clone(),
        };
        poll_subject(&store, &strategy, &handle).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn poller_stops_when_subject_is_deleted() {
        let memory = MemoryStore::new();
        let store: Arc<dyn ResourceStore> = Arc::new(memory.clone());
        let strategy: Arc<dyn StatusStrategy> = Arc::new(CountingStrategy {
            ticks: Arc::new(AtomicUsize::new(0)),
        });
        let registry = PollerRegistry::new();
        store.create(&subject("b-1")).await.unwrap();

        ensure_poller(&store, &strategy, &registry, "b-1").await;
        memory.delete(ResourceKind::Backup, "b-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.active_count().await, 0);
    }
}
