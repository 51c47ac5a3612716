//! etcd-backed `ResourceStore`.
//!
//! Key layout: `{prefix}/{kind}/{name}`, value is the resource as JSON.
//! `metadata.version` maps to the key's etcd `mod_revision`; the version
//! field inside the stored document is never trusted, it is overwritten from
//! the key-value metadata on every read.

use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use log::{debug, warn};
use serde_json::Value as JsonValue;
use tokio::sync::{RwLock, mpsc};

use common::resource::{
    Resource, ResourceKind, StateSelector, WatchEvent, WatchEventType,
};
use common::store::{ResourceStore, StatusPatch, StoreError};

use crate::config::EtcdSettings;

const WATCH_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<RwLock<Client>>,
    prefix: String,
}

impl EtcdStore {
    pub async fn new(settings: &EtcdSettings) -> Result<Self, StoreError> {
        let options = match (&settings.username, &settings.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user, password))
            }
            _ => None,
        };
        let client = Client::connect(&settings.endpoints, options)
            .await
            .map_err(transport)?;
        Ok(EtcdStore {
            client: Arc::new(RwLock::new(client)),
            prefix: settings.prefix.trim_end_matches('/').to_string(),
        })
    }

    fn key(&self, kind: ResourceKind, name: &str) -> String {
        format!("{}/{kind}/{name}", self.prefix)
    }

    fn kind_prefix(&self, kind: ResourceKind) -> String {
        format!("{}/{kind}/", self.prefix)
    }
}

fn transport(e: etcd_client::Error) -> StoreError {
    StoreError::Transport(e.into())
}

fn decode(kind: ResourceKind, name: &str, kv: &etcd_client::KeyValue) -> Result<Resource, StoreError> {
    let mut resource: Resource = serde_json::from_slice(kv.value()).map_err(|e| {
        StoreError::InvalidResource(format!("stored {kind} resource {name} is malformed: {e}"))
    })?;
    resource.metadata.version = kv.mod_revision();
    Ok(resource)
}

fn encode(resource: &Resource) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(resource).map_err(|e| StoreError::InvalidResource(e.to_string()))
}

#[async_trait]
impl ResourceStore for EtcdStore {
    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Resource, StoreError> {
        let key = self.key(kind, name);
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await.map_err(transport)?;
        match resp.kvs().first() {
            Some(kv) => decode(kind, name, kv),
            None => Err(StoreError::not_found(kind, name)),
        }
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let key = self.key(resource.kind, resource.name());
        let value = encode(resource)?;
        // only create when no live version of the key exists
        let txn = Txn::new()
            .when([Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key.clone(), value, None)]);
        let mut client = self.client.write().await;
        let resp = client.txn(txn).await.map_err(transport)?;
        if !resp.succeeded() {
            return Err(StoreError::AlreadyExists {
                kind: resource.kind,
                name: resource.name().to_string(),
            });
        }
        let mut created = resource.clone();
        created.metadata.version = resp.header().map(|h| h.revision()).unwrap_or(0);
        Ok(created)
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: StateSelector,
    ) -> Result<Vec<Resource>, StoreError> {
        let key_prefix = self.kind_prefix(kind);
        let mut client = self.client.write().await;
        let resp = client
            .get(key_prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(transport)?;
        drop(client);
        let mut matching = Vec::new();
        for kv in resp.kvs() {
            let name = resource_name(kv.key());
            let resource = match decode(kind, &name, kv) {
                Ok(resource) => resource,
                Err(e) => {
                    warn!("skipping undecodable {kind} resource {name}: {e}");
                    continue;
                }
            };
            if selector.matches(resource.status.state) {
                matching.push(resource);
            }
        }
        Ok(matching)
    }

    async fn update_options(
        &self,
        kind: ResourceKind,
        name: &str,
        options: JsonValue,
    ) -> Result<Resource, StoreError> {
        let mut current = self.get(kind, name).await?;
        let expected = current.metadata.version;
        current.spec.options = options;
        let key = self.key(kind, name);
        let value = encode(&current)?;
        // version-checked replace; a concurrent writer wins the key
        let txn = Txn::new()
            .when([Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                expected,
            )])
            .and_then([TxnOp::put(key.clone(), value, None)]);
        let mut client = self.client.write().await;
        let resp = client.txn(txn).await.map_err(transport)?;
        if !resp.succeeded() {
            return Err(StoreError::Conflict {
                kind,
                name: name.to_string(),
            });
        }
        current.metadata.version = resp.header().map(|h| h.revision()).unwrap_or(expected);
        Ok(current)
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        name: &str,
        patch: StatusPatch,
    ) -> Result<Resource, StoreError> {
        let mut current = self.get(kind, name).await?;
        if let Some(expected) = patch.expect_version {
            if current.metadata.version != expected {
                return Err(StoreError::Conflict {
                    kind,
                    name: name.to_string(),
                });
            }
        }
        let guard_version = current.metadata.version;
        patch.apply(&mut current);
        let key = self.key(kind, name);
        let value = encode(&current)?;
        let mut client = self.client.write().await;
        let resp = if patch.expect_version.is_some() {
            let txn = Txn::new()
                .when([Compare::mod_revision(
                    key.clone(),
                    CompareOp::Equal,
                    guard_version,
                )])
                .and_then([TxnOp::put(key.clone(), value, None)]);
            let resp = client.txn(txn).await.map_err(transport)?;
            if !resp.succeeded() {
                return Err(StoreError::Conflict {
                    kind,
                    name: name.to_string(),
                });
            }
            resp.header().map(|h| h.revision())
        } else {
            let resp = client.put(key.clone(), value, None).await.map_err(transport)?;
            resp.header().map(|h| h.revision())
        };
        current.metadata.version = resp.unwrap_or(guard_version);
        Ok(current)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), StoreError> {
        let key = self.key(kind, name);
        let mut client = self.client.write().await;
        let resp = client.delete(key, None).await.map_err(transport)?;
        if resp.deleted() == 0 {
            return Err(StoreError::not_found(kind, name));
        }
        Ok(())
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        selector: StateSelector,
    ) -> Result<mpsc::Receiver<WatchEvent>, StoreError> {
        let key_prefix = self.kind_prefix(kind);
        let options = WatchOptions::new().with_prefix().with_prev_key();
        let mut client = self.client.write().await;
        let (watcher, mut stream) = client
            .watch(key_prefix, Some(options))
            .await
            .map_err(transport)?;
        drop(client);

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            // keeps the server-side watch alive for the task's lifetime
            let _watcher = watcher;
            while let Some(resp_result) = stream.next().await {
                let resp = match resp_result {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!("etcd watch stream error on {kind} resources: {e}");
                        break;
                    }
                };
                if resp.canceled() {
                    warn!("etcd watch channel canceled for {kind} resources");
                    break;
                }
                for ev in resp.events() {
                    let Some(event) = translate(kind, &selector, ev) else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        debug!("watch receiver for {kind} resources dropped");
                        return;
                    }
                }
            }
            // the channel closes when tx drops; the poller resubscribes
        });
        Ok(rx)
    }
}

/// Maps one raw etcd event to the store-level watch event, applying the
/// state filter. Deletions always pass through so pollers can react to
/// subjects vanishing mid-flight.
fn translate(
    kind: ResourceKind,
    selector: &StateSelector,
    ev: &etcd_client::Event,
) -> Option<WatchEvent> {
    match ev.event_type() {
        EventType::Put => {
            let kv = ev.kv()?;
            let name = resource_name(kv.key());
            let resource = match decode(kind, &name, kv) {
                Ok(resource) => resource,
                Err(e) => {
                    warn!("skipping undecodable watch event for {kind} {name}: {e}");
                    return None;
                }
            };
            if !selector.matches(resource.status.state) {
                return None;
            }
            let event_type = if kv.create_revision() == kv.mod_revision() {
                WatchEventType::Added
            } else {
                WatchEventType::Modified
            };
            Some(WatchEvent {
                event_type,
                resource,
            })
        }
        EventType::Delete => {
            // the live kv carries no value on delete, the previous one does
            let kv = ev.prev_kv()?;
            let name = resource_name(kv.key());
            match decode(kind, &name, kv) {
                Ok(resource) => Some(WatchEvent {
                    event_type: WatchEventType::Deleted,
                    resource,
                }),
                Err(e) => {
                    warn!("skipping undecodable delete event for {kind} {name}: {e}");
                    None
                }
            }
        }
    }
}

fn resource_name(key: &[u8]) -> String {
    let key = String::from_utf8_lossy(key);
    key.rsplit('/').next().unwrap_or(&key).to_string()
}
