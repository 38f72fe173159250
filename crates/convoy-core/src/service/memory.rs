//! In-memory single-cluster client
//!
//! Implements the informer contract over an in-process object store:
//! handlers see an initial `Added` for every stored object and then every
//! mutation, indexes back field selectors in `list`, and informers report
//! synced once the client has started.
//!
//! Fault injection (`ClientFaults`) lets tests exercise admission, fan-out and
//! eviction failure paths without a real cluster.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use convoy_common::{ConvoyError, Result};

use crate::model::{
    ClusterCfgInfo, ListOptions, ObjectKey, Patch, Resource, ResourceEvent, ResourceKind,
};

use super::client::{
    ClusterClient, ClusterClientFactory, IndexerFunc, Informers, Lifecycle, ResourceEventHandler,
    ResourceOperate,
};

/// Failures injected into an in-memory client
#[derive(Clone, Debug, Default)]
pub struct ClientFaults {
    /// `start` fails immediately with this reason
    pub fail_start: Option<String>,
    /// `get_informer` fails with this message
    pub fail_informer: Option<String>,
    /// `add_resource_event_handler` fails with this message
    pub fail_handler: Option<String>,
    /// `set_index_field` fails with this message
    pub fail_index: Option<String>,
    /// Informers never report synced
    pub hold_sync: bool,
    /// `stop` sleeps this long before releasing
    pub stop_delay: Option<Duration>,
}

#[derive(Default)]
struct KindStore {
    objects: BTreeMap<ObjectKey, Resource>,
    handlers: Vec<Arc<dyn ResourceEventHandler>>,
    indexes: HashMap<String, IndexerFunc>,
    synced: bool,
}

/// Single-cluster client backed by process memory
pub struct InMemoryClusterClient {
    cfg: ClusterCfgInfo,
    stores: DashMap<ResourceKind, KindStore>,
    faults: RwLock<ClientFaults>,
    connected: AtomicBool,
    started: AtomicBool,
    shutdown: CancellationToken,
    revision: AtomicU64,
    start_count: AtomicUsize,
    stop_count: AtomicUsize,
    // Serializes mutation + delivery so each handler sees events in store order
    dispatch: Mutex<()>,
}

impl InMemoryClusterClient {
    pub fn new(cfg: ClusterCfgInfo) -> Self {
        Self::with_faults(cfg, ClientFaults::default())
    }

    pub fn with_faults(cfg: ClusterCfgInfo, faults: ClientFaults) -> Self {
        Self {
            cfg,
            stores: DashMap::new(),
            faults: RwLock::new(faults),
            connected: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            revision: AtomicU64::new(0),
            start_count: AtomicUsize::new(0),
            stop_count: AtomicUsize::new(0),
            dispatch: Mutex::new(()),
        }
    }

    /// Seed objects without emitting events
    pub fn seed(&self, resources: impl IntoIterator<Item = Resource>) {
        for mut resource in resources {
            resource.resource_version = Some(self.next_revision());
            self.stores
                .entry(resource.kind.clone())
                .or_default()
                .objects
                .insert(resource.key.clone(), resource);
        }
    }

    pub fn set_faults(&self, faults: ClientFaults) {
        *self.faults.write() = faults;
    }

    /// Release held informers, marking them synced if the client runs
    pub fn release_sync(&self) {
        self.faults.write().hold_sync = false;
        if self.started.load(Ordering::SeqCst) {
            self.mark_synced();
        }
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self, kind: &ResourceKind) -> usize {
        self.stores.get(kind).map(|s| s.handlers.len()).unwrap_or(0)
    }

    pub fn index_fields(&self, kind: &ResourceKind) -> Vec<String> {
        let mut fields: Vec<String> = self
            .stores
            .get(kind)
            .map(|s| s.indexes.keys().cloned().collect())
            .unwrap_or_default();
        fields.sort();
        fields
    }

    pub fn has_informer(&self, kind: &ResourceKind) -> bool {
        self.stores.contains_key(kind)
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn mark_synced(&self) {
        for mut store in self.stores.iter_mut() {
            store.synced = true;
        }
    }

    fn synced_on_create(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.faults.read().hold_sync
    }

    fn not_found(&self, kind: &ResourceKind, key: &ObjectKey) -> ConvoyError {
        ConvoyError::ResourceNotFound {
            cluster: self.cfg.name.clone(),
            key: format!("{}:{}", kind, key),
        }
    }

    fn client_error(&self, message: impl Into<String>) -> ConvoyError {
        ConvoyError::Client {
            cluster: self.cfg.name.clone(),
            message: message.into(),
        }
    }

    /// Apply `mutate` to the store of `kind`, then deliver the produced event
    fn mutate<T>(
        &self,
        kind: &ResourceKind,
        mutate: impl FnOnce(&mut KindStore) -> Result<(T, Vec<ResourceEvent>)>,
    ) -> Result<T> {
        let _dispatch = self.dispatch.lock();
        let (value, events, handlers) = {
            let synced = self.synced_on_create();
            let mut store = self.stores.entry(kind.clone()).or_insert_with(|| KindStore {
                synced,
                ..Default::default()
            });
            let (value, events) = mutate(&mut *store)?;
            (value, events, store.handlers.clone())
        };
        for event in &events {
            for handler in &handlers {
                handler.on_event(&self.cfg.name, event);
            }
        }
        Ok(value)
    }

    fn ensure_store(&self, kind: &ResourceKind) {
        let synced = self.synced_on_create();
        self.stores.entry(kind.clone()).or_insert_with(|| KindStore {
            synced,
            ..Default::default()
        });
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Value::Object(map) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl ResourceOperate for InMemoryClusterClient {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<Resource> {
        self.stores
            .get(kind)
            .and_then(|s| s.objects.get(key).cloned())
            .ok_or_else(|| self.not_found(kind, key))
    }

    async fn create(&self, mut resource: Resource) -> Result<Resource> {
        let kind = resource.kind.clone();
        self.mutate(&kind, |store| {
            if store.objects.contains_key(&resource.key) {
                return Err(ConvoyError::Conflict {
                    cluster: self.cfg.name.clone(),
                    key: resource.key.to_string(),
                });
            }
            resource.resource_version = Some(self.next_revision());
            store.objects.insert(resource.key.clone(), resource.clone());
            Ok((resource.clone(), vec![ResourceEvent::Added(resource)]))
        })
    }

    async fn update(&self, mut resource: Resource) -> Result<Resource> {
        let kind = resource.kind.clone();
        self.mutate(&kind, |store| {
            let old = store
                .objects
                .get(&resource.key)
                .cloned()
                .ok_or_else(|| self.not_found(&kind, &resource.key))?;
            if resource.resource_version.is_some()
                && resource.resource_version != old.resource_version
            {
                return Err(ConvoyError::Conflict {
                    cluster: self.cfg.name.clone(),
                    key: resource.key.to_string(),
                });
            }
            resource.resource_version = Some(self.next_revision());
            store.objects.insert(resource.key.clone(), resource.clone());
            Ok((
                resource.clone(),
                vec![ResourceEvent::Updated { old, new: resource }],
            ))
        })
    }

    async fn status_update(&self, resource: Resource) -> Result<Resource> {
        let kind = resource.kind.clone();
        self.mutate(&kind, |store| {
            let old = store
                .objects
                .get(&resource.key)
                .cloned()
                .ok_or_else(|| self.not_found(&kind, &resource.key))?;
            let mut new = old.clone();
            new.status = resource.status;
            new.resource_version = Some(self.next_revision());
            store.objects.insert(new.key.clone(), new.clone());
            Ok((new.clone(), vec![ResourceEvent::Updated { old, new }]))
        })
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<()> {
        self.mutate(kind, |store| {
            let old = store
                .objects
                .remove(key)
                .ok_or_else(|| self.not_found(kind, key))?;
            Ok(((), vec![ResourceEvent::Deleted(old)]))
        })
    }

    async fn patch(&self, kind: &ResourceKind, key: &ObjectKey, patch: Patch) -> Result<Resource> {
        self.mutate(kind, |store| {
            let old = store
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| self.not_found(kind, key))?;
            let mut new = match patch {
                Patch::Spec(spec) => {
                    let mut new = old.clone();
                    new.spec = spec;
                    new
                }
                Patch::Merge(doc) => {
                    let mut value = serde_json::to_value(&old)
                        .map_err(|e| self.client_error(e.to_string()))?;
                    merge_patch(&mut value, &doc);
                    let mut new: Resource = serde_json::from_value(value)
                        .map_err(|e| self.client_error(format!("invalid patch: {}", e)))?;
                    // Identity is not patchable
                    new.kind = old.kind.clone();
                    new.key = old.key.clone();
                    new
                }
            };
            new.resource_version = Some(self.next_revision());
            store.objects.insert(key.clone(), new.clone());
            Ok((new.clone(), vec![ResourceEvent::Updated { old, new }]))
        })
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<Resource>> {
        let Some(store) = self.stores.get(kind) else {
            return Ok(Vec::new());
        };
        let indexer = match &options.field {
            Some((field, _)) => Some(
                store
                    .indexes
                    .get(field)
                    .cloned()
                    .ok_or_else(|| self.client_error(format!("no index for field '{}'", field)))?,
            ),
            None => None,
        };
        Ok(store
            .objects
            .values()
            .filter(|r| options.matches(r))
            .filter(|r| match (&indexer, &options.field) {
                (Some(extract), Some((_, value))) => extract(r).iter().any(|v| v == value),
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn delete_all_of(&self, kind: &ResourceKind, options: &ListOptions) -> Result<usize> {
        let matching: Vec<ObjectKey> = self
            .list(kind, options)
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();
        self.mutate(kind, |store| {
            let events: Vec<ResourceEvent> = matching
                .iter()
                .filter_map(|key| store.objects.remove(key))
                .map(ResourceEvent::Deleted)
                .collect();
            Ok((events.len(), events))
        })
    }
}

#[async_trait]
impl Informers for InMemoryClusterClient {
    async fn get_informer(&self, kind: &ResourceKind) -> Result<()> {
        if let Some(message) = self.faults.read().fail_informer.clone() {
            return Err(self.client_error(message));
        }
        self.ensure_store(kind);
        Ok(())
    }

    async fn add_resource_event_handler(
        &self,
        kind: &ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        if let Some(message) = self.faults.read().fail_handler.clone() {
            return Err(self.client_error(message));
        }
        let _dispatch = self.dispatch.lock();
        self.ensure_store(kind);
        let existing: Vec<Resource> = {
            let mut store = self
                .stores
                .get_mut(kind)
                .ok_or_else(|| self.client_error(format!("informer for {} vanished", kind)))?;
            store.handlers.push(handler.clone());
            store.objects.values().cloned().collect()
        };
        for resource in existing {
            handler.on_event(&self.cfg.name, &ResourceEvent::Added(resource));
        }
        debug!(cluster = %self.cfg.name, kind = %kind, "Added resource event handler");
        Ok(())
    }

    async fn set_index_field(
        &self,
        kind: &ResourceKind,
        field: &str,
        extractor: IndexerFunc,
    ) -> Result<()> {
        if let Some(message) = self.faults.read().fail_index.clone() {
            return Err(self.client_error(message));
        }
        self.ensure_store(kind);
        let mut store = self
            .stores
            .get_mut(kind)
            .ok_or_else(|| self.client_error(format!("informer for {} vanished", kind)))?;
        if store.indexes.contains_key(field) {
            return Err(self.client_error(format!(
                "indexer conflict: field '{}' already indexed for {}",
                field, kind
            )));
        }
        store.indexes.insert(field.to_string(), extractor);
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.stores.iter().all(|s| s.synced)
    }
}

#[async_trait]
impl Lifecycle for InMemoryClusterClient {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.faults.read().fail_start.clone() {
            return Err(ConvoyError::Start {
                cluster: self.cfg.name.clone(),
                reason,
            });
        }

        self.started.store(true, Ordering::SeqCst);
        if !self.faults.read().hold_sync {
            self.mark_synced();
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(cluster = %self.cfg.name, "In-memory cluster client started");

        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }

        self.connected.store(false, Ordering::SeqCst);
        info!(cluster = %self.cfg.name, "In-memory cluster client exited");
        Ok(())
    }

    async fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.read().stop_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn cluster_cfg_info(&self) -> ClusterCfgInfo {
        self.cfg.clone()
    }
}

/// Factory producing in-memory clients
///
/// Keeps every built client so callers can reach the concrete type, seeds each
/// new client with the same objects and applies per-cluster faults.
#[derive(Default)]
pub struct InMemoryClientFactory {
    seed: RwLock<Vec<Resource>>,
    faults: DashMap<String, ClientFaults>,
    built: DashMap<String, Arc<InMemoryClusterClient>>,
    build_count: AtomicUsize,
}

impl InMemoryClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: Vec<Resource>) -> Self {
        Self {
            seed: RwLock::new(seed),
            ..Default::default()
        }
    }

    /// Faults applied to clients built for `cluster` from now on
    pub fn set_faults(&self, cluster: &str, faults: ClientFaults) {
        self.faults.insert(cluster.to_string(), faults);
    }

    /// Most recently built client for `cluster`
    pub fn client(&self, cluster: &str) -> Option<Arc<InMemoryClusterClient>> {
        self.built.get(cluster).map(|c| c.value().clone())
    }

    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }
}

impl ClusterClientFactory for InMemoryClientFactory {
    fn build(&self, cfg: &ClusterCfgInfo) -> Result<Arc<dyn ClusterClient>> {
        cfg.validate()?;
        let faults = self
            .faults
            .get(&cfg.name)
            .map(|f| f.value().clone())
            .unwrap_or_default();
        let client = Arc::new(InMemoryClusterClient::with_faults(cfg.clone(), faults));
        client.seed(self.seed.read().iter().cloned());
        self.built.insert(cfg.name.clone(), client.clone());
        self.build_count.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }
}
