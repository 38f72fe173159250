//! Kubernetes-backed cluster client
//!
//! Talks to one API server through `kube` using dynamic objects, so any
//! group/version/kind can be served without generated types. Informers are
//! `kube::runtime::watcher` streams feeding a per-kind cache; handlers and
//! field indexes registered before `start` are wired up when the watchers
//! come up, and kinds requested later get a watcher on demand.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use kube::{
    Api, Client, Config,
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch as KubePatch,
        PatchParams, PostParams,
    },
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        WatchStreamExt,
        watcher::{self, Event},
    },
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convoy_common::{ConvoyError, Result};

use crate::model::{
    ClusterCfgInfo, ListOptions, ObjectKey, Patch, Resource, ResourceEvent, ResourceKind,
};

use super::client::{
    ClusterClient, ClusterClientFactory, IndexerFunc, Informers, KubernetesResource, Lifecycle,
    ResourceEventHandler, ResourceOperate,
};

/// Watch-fed cache of one resource kind
struct KindCache {
    api_resource: ApiResource,
    objects: RwLock<BTreeMap<ObjectKey, Resource>>,
    // Objects collected during a (re)list, swapped in on InitDone
    relist: Mutex<Option<BTreeMap<ObjectKey, Resource>>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler>>>,
    indexes: RwLock<HashMap<String, IndexerFunc>>,
    synced: AtomicBool,
    watching: AtomicBool,
    // Serializes cache mutation + delivery against handler registration
    dispatch: Mutex<()>,
}

impl KindCache {
    fn new(kind: &ResourceKind) -> Self {
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind);
        Self {
            api_resource: ApiResource::from_gvk(&gvk),
            objects: RwLock::new(BTreeMap::new()),
            relist: Mutex::new(None),
            handlers: RwLock::new(Vec::new()),
            indexes: RwLock::new(HashMap::new()),
            synced: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            dispatch: Mutex::new(()),
        }
    }

    fn deliver(&self, cluster: &str, events: &[ResourceEvent]) {
        let handlers = self.handlers.read().clone();
        for event in events {
            for handler in &handlers {
                handler.on_event(cluster, event);
            }
        }
    }

    fn apply(&self, cluster: &str, resource: Resource) {
        let _dispatch = self.dispatch.lock();
        let old = self
            .objects
            .write()
            .insert(resource.key.clone(), resource.clone());
        let event = match old {
            Some(old) => ResourceEvent::Updated { old, new: resource },
            None => ResourceEvent::Added(resource),
        };
        self.deliver(cluster, &[event]);
    }

    fn delete(&self, cluster: &str, key: &ObjectKey) {
        let _dispatch = self.dispatch.lock();
        let removed = self.objects.write().remove(key);
        if let Some(resource) = removed {
            self.deliver(cluster, &[ResourceEvent::Deleted(resource)]);
        }
    }

    fn begin_relist(&self) {
        *self.relist.lock() = Some(BTreeMap::new());
    }

    fn relist_apply(&self, resource: Resource) {
        if let Some(pending) = self.relist.lock().as_mut() {
            pending.insert(resource.key.clone(), resource);
        }
    }

    /// Swap in the relisted set, emitting the difference against the cache
    fn finish_relist(&self, cluster: &str) {
        let Some(fresh) = self.relist.lock().take() else {
            return;
        };

        let _dispatch = self.dispatch.lock();
        let mut events = Vec::new();
        {
            let mut objects = self.objects.write();
            for (key, old) in objects.iter() {
                if !fresh.contains_key(key) {
                    events.push(ResourceEvent::Deleted(old.clone()));
                }
            }
            for (key, new) in &fresh {
                match objects.get(key) {
                    Some(old) if old.resource_version == new.resource_version => {}
                    Some(old) => events.push(ResourceEvent::Updated {
                        old: old.clone(),
                        new: new.clone(),
                    }),
                    None => events.push(ResourceEvent::Added(new.clone())),
                }
            }
            *objects = fresh;
        }
        self.synced.store(true, Ordering::SeqCst);
        self.deliver(cluster, &events);
    }
}

/// Single-cluster client backed by a Kubernetes API server
pub struct KubeClusterClient {
    cfg: ClusterCfgInfo,
    client: tokio::sync::RwLock<Option<Client>>,
    caches: DashMap<ResourceKind, Arc<KindCache>>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    // Scope of the running `start`; watchers are bound to it
    run_token: Mutex<Option<CancellationToken>>,
}

impl KubeClusterClient {
    pub fn new(cfg: ClusterCfgInfo) -> Self {
        Self {
            cfg,
            client: tokio::sync::RwLock::new(None),
            caches: DashMap::new(),
            connected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            run_token: Mutex::new(None),
        }
    }

    fn client_error(&self, message: impl Display) -> ConvoyError {
        ConvoyError::Client {
            cluster: self.cfg.name.clone(),
            message: message.to_string(),
        }
    }

    fn map_kube_error(&self, key: &ObjectKey, err: kube::Error) -> ConvoyError {
        if let kube::Error::Api(response) = &err {
            match response.code {
                404 => {
                    return ConvoyError::ResourceNotFound {
                        cluster: self.cfg.name.clone(),
                        key: key.to_string(),
                    };
                }
                409 => {
                    return ConvoyError::Conflict {
                        cluster: self.cfg.name.clone(),
                        key: key.to_string(),
                    };
                }
                _ => {}
            }
        }
        self.client_error(err)
    }

    async fn connect(&self) -> Result<Client> {
        let start_error = |reason: String| ConvoyError::Start {
            cluster: self.cfg.name.clone(),
            reason,
        };

        let mut config =
            Config::from_custom_kubeconfig(self.kubeconfig()?, &KubeConfigOptions::default())
                .await
                .map_err(|e| start_error(format!("failed to load kubeconfig: {}", e)))?;
        config.read_timeout = Some(self.cfg.timeout());

        let client = Client::try_from(config)
            .map_err(|e| start_error(format!("failed to create client: {}", e)))?;
        let version = client
            .apiserver_version()
            .await
            .map_err(|e| start_error(format!("API server unreachable: {}", e)))?;
        info!(
            cluster = %self.cfg.name,
            version = %version.git_version,
            "Connected to Kubernetes API server"
        );
        Ok(client)
    }

    async fn current_client(&self) -> Result<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| ConvoyError::NotConnected(self.cfg.name.clone()))
    }

    fn api(&self, client: Client, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let api_resource = self.cache(kind).api_resource.clone();
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &api_resource),
            None => Api::all_with(client, &api_resource),
        }
    }

    fn cache(&self, kind: &ResourceKind) -> Arc<KindCache> {
        self.caches
            .entry(kind.clone())
            .or_insert_with(|| Arc::new(KindCache::new(kind)))
            .clone()
    }

    /// Start a watcher for `kind` if the client runs and none is active
    async fn ensure_watch(&self, kind: &ResourceKind) {
        let cache = self.cache(kind);
        let Some(run) = self.run_token.lock().clone() else {
            return;
        };
        let Some(client) = self.client.read().await.clone() else {
            return;
        };
        self.spawn_watcher(client, kind.clone(), cache, run);
    }

    fn spawn_watcher(
        &self,
        client: Client,
        kind: ResourceKind,
        cache: Arc<KindCache>,
        run: CancellationToken,
    ) {
        if cache.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let cluster = self.cfg.name.clone();
        let api: Api<DynamicObject> = match self.cfg.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, &cache.api_resource),
            None => Api::all_with(client, &cache.api_resource),
        };

        tokio::spawn(async move {
            info!(cluster = %cluster, kind = %kind, "Starting informer");
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            tokio::pin!(stream);

            loop {
                let next = tokio::select! {
                    _ = run.cancelled() => break,
                    next = stream.try_next() => next,
                };

                match next {
                    Ok(Some(Event::Apply(obj))) => cache.apply(&cluster, to_resource(&kind, obj)),
                    Ok(Some(Event::Delete(obj))) => {
                        cache.delete(&cluster, &to_resource(&kind, obj).key)
                    }
                    Ok(Some(Event::Init)) => cache.begin_relist(),
                    Ok(Some(Event::InitApply(obj))) => cache.relist_apply(to_resource(&kind, obj)),
                    Ok(Some(Event::InitDone)) => {
                        cache.finish_relist(&cluster);
                        debug!(cluster = %cluster, kind = %kind, "Informer synced");
                    }
                    Ok(None) => break,
                    Err(e) => warn!(cluster = %cluster, kind = %kind, error = %e, "Informer watch error"),
                }
            }

            cache.watching.store(false, Ordering::SeqCst);
            info!(cluster = %cluster, kind = %kind, "Informer stopped");
        });
    }
}

/// Convert a dynamic object into the fleet resource model
fn to_resource(kind: &ResourceKind, obj: DynamicObject) -> Resource {
    let metadata = obj.metadata;
    let key = ObjectKey {
        namespace: metadata.namespace,
        name: metadata.name.unwrap_or_default(),
    };
    let mut resource = Resource::new(kind.clone(), key);
    resource.labels = metadata.labels.unwrap_or_default();
    resource.resource_version = metadata.resource_version;
    resource.spec = obj.data.get("spec").cloned().unwrap_or(Value::Null);
    resource.status = obj.data.get("status").cloned().unwrap_or(Value::Null);
    resource
}

/// Convert a fleet resource into a dynamic object for `api_resource`
fn to_dynamic(api_resource: &ApiResource, resource: &Resource) -> DynamicObject {
    let mut obj = DynamicObject::new(&resource.key.name, api_resource);
    if let Some(ns) = &resource.key.namespace {
        obj = obj.within(ns);
    }
    if !resource.labels.is_empty() {
        obj.metadata.labels = Some(resource.labels.clone());
    }
    obj.metadata.resource_version = resource.resource_version.clone();

    let mut data = serde_json::Map::new();
    if !resource.spec.is_null() {
        data.insert("spec".to_string(), resource.spec.clone());
    }
    if !resource.status.is_null() {
        data.insert("status".to_string(), resource.status.clone());
    }
    obj.data(Value::Object(data))
}

/// Swap the whole `spec` of `obj`, leaving metadata and status alone
fn replace_spec(obj: &mut DynamicObject, spec: Value) {
    match obj.data.as_object_mut() {
        Some(fields) => {
            fields.insert("spec".to_string(), spec);
        }
        None => obj.data = json!({ "spec": spec }),
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ResourceOperate for KubeClusterClient {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<Resource> {
        let api = self.api(self.current_client().await?, kind, key.namespace.as_deref());
        let obj = api
            .get(&key.name)
            .await
            .map_err(|e| self.map_kube_error(key, e))?;
        Ok(to_resource(kind, obj))
    }

    async fn create(&self, resource: Resource) -> Result<Resource> {
        let kind = resource.kind.clone();
        let api = self.api(
            self.current_client().await?,
            &kind,
            resource.key.namespace.as_deref(),
        );
        let obj = to_dynamic(&self.cache(&kind).api_resource, &resource);
        let created = api
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| self.map_kube_error(&resource.key, e))?;
        Ok(to_resource(&kind, created))
    }

    async fn update(&self, resource: Resource) -> Result<Resource> {
        let kind = resource.kind.clone();
        let api = self.api(
            self.current_client().await?,
            &kind,
            resource.key.namespace.as_deref(),
        );
        let obj = to_dynamic(&self.cache(&kind).api_resource, &resource);
        let updated = api
            .replace(&resource.key.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| self.map_kube_error(&resource.key, e))?;
        Ok(to_resource(&kind, updated))
    }

    async fn status_update(&self, resource: Resource) -> Result<Resource> {
        let kind = resource.kind.clone();
        let api = self.api(
            self.current_client().await?,
            &kind,
            resource.key.namespace.as_deref(),
        );
        let patch = KubePatch::Merge(json!({ "status": resource.status }));
        let updated = api
            .patch_status(&resource.key.name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| self.map_kube_error(&resource.key, e))?;
        Ok(to_resource(&kind, updated))
    }

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<()> {
        let api = self.api(self.current_client().await?, kind, key.namespace.as_deref());
        api.delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| self.map_kube_error(key, e))?;
        Ok(())
    }

    async fn patch(&self, kind: &ResourceKind, key: &ObjectKey, patch: Patch) -> Result<Resource> {
        let api = self.api(self.current_client().await?, kind, key.namespace.as_deref());
        let patched = match patch {
            Patch::Merge(body) => api
                .patch(&key.name, &PatchParams::default(), &KubePatch::Merge(body))
                .await
                .map_err(|e| self.map_kube_error(key, e))?,
            // Replaced at the read resourceVersion; concurrent writers conflict
            Patch::Spec(spec) => {
                let mut current = api
                    .get(&key.name)
                    .await
                    .map_err(|e| self.map_kube_error(key, e))?;
                replace_spec(&mut current, spec);
                api.replace(&key.name, &PostParams::default(), &current)
                    .await
                    .map_err(|e| self.map_kube_error(key, e))?
            }
        };
        Ok(to_resource(kind, patched))
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<Resource>> {
        // Field selectors are answered from the informer cache through an index
        if let Some((field, value)) = &options.field {
            let cache = self.cache(kind);
            let extractor = cache.indexes.read().get(field).cloned().ok_or_else(|| {
                self.client_error(format!("no index for field '{}' on {}", field, kind))
            })?;
            let objects = cache.objects.read();
            return Ok(objects
                .values()
                .filter(|r| options.matches(r))
                .filter(|r| extractor(r).iter().any(|v| v == value))
                .cloned()
                .collect());
        }

        let api = self.api(self.current_client().await?, kind, options.namespace.as_deref());
        let mut params = ListParams::default();
        if !options.labels.is_empty() {
            params = params.labels(&label_selector(&options.labels));
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| self.client_error(e))?;
        Ok(list
            .items
            .into_iter()
            .map(|obj| to_resource(kind, obj))
            .collect())
    }

    async fn delete_all_of(&self, kind: &ResourceKind, options: &ListOptions) -> Result<usize> {
        let matching = self.list(kind, options).await?;
        let mut deleted = 0;
        for resource in matching {
            match self.delete(kind, &resource.key).await {
                Ok(()) => deleted += 1,
                Err(ConvoyError::ResourceNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Informers for KubeClusterClient {
    async fn get_informer(&self, kind: &ResourceKind) -> Result<()> {
        self.cache(kind);
        self.ensure_watch(kind).await;
        Ok(())
    }

    async fn add_resource_event_handler(
        &self,
        kind: &ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        let cache = self.cache(kind);
        {
            let _dispatch = cache.dispatch.lock();
            cache.handlers.write().push(handler.clone());
            let existing: Vec<Resource> = cache.objects.read().values().cloned().collect();
            for resource in existing {
                handler.on_event(&self.cfg.name, &ResourceEvent::Added(resource));
            }
        }
        self.ensure_watch(kind).await;
        debug!(cluster = %self.cfg.name, kind = %kind, "Added resource event handler");
        Ok(())
    }

    async fn set_index_field(
        &self,
        kind: &ResourceKind,
        field: &str,
        extractor: IndexerFunc,
    ) -> Result<()> {
        let cache = self.cache(kind);
        {
            let mut indexes = cache.indexes.write();
            if indexes.contains_key(field) {
                return Err(self.client_error(format!(
                    "indexer conflict: field '{}' already indexed for {}",
                    field, kind
                )));
            }
            indexes.insert(field.to_string(), extractor);
        }
        self.ensure_watch(kind).await;
        Ok(())
    }

    fn has_synced(&self) -> bool {
        self.caches
            .iter()
            .all(|c| c.value().synced.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Lifecycle for KubeClusterClient {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    async fn start(&self, token: CancellationToken) -> Result<()> {
        let client = self.connect().await?;
        *self.client.write().await = Some(client.clone());

        let run = token.child_token();
        *self.run_token.lock() = Some(run.clone());
        self.connected.store(true, Ordering::SeqCst);

        let caches: Vec<(ResourceKind, Arc<KindCache>)> = self
            .caches
            .iter()
            .map(|c| (c.key().clone(), c.value().clone()))
            .collect();
        for (kind, cache) in caches {
            self.spawn_watcher(client.clone(), kind, cache, run.clone());
        }

        tokio::select! {
            _ = token.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }

        run.cancel();
        *self.run_token.lock() = None;
        self.connected.store(false, Ordering::SeqCst);
        info!(cluster = %self.cfg.name, "Kubernetes cluster client exited");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(run) = self.run_token.lock().take() {
            run.cancel();
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.client.write().await = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn cluster_cfg_info(&self) -> ClusterCfgInfo {
        self.cfg.clone()
    }

    fn kubernetes(&self) -> Option<&dyn KubernetesResource> {
        Some(self)
    }
}

#[async_trait]
impl KubernetesResource for KubeClusterClient {
    fn kubeconfig(&self) -> Result<Kubeconfig> {
        let cfg = &self.cfg;
        let document = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": cfg.name,
                "cluster": {
                    "server": cfg.endpoint,
                    "certificate-authority-data": cfg.ca_data,
                    "insecure-skip-tls-verify": cfg.insecure_skip_tls_verify,
                },
            }],
            "users": [{
                "name": cfg.name,
                "user": { "token": cfg.token },
            }],
            "contexts": [{
                "name": cfg.name,
                "context": {
                    "cluster": cfg.name,
                    "user": cfg.name,
                    "namespace": cfg.namespace,
                },
            }],
            "current-context": cfg.name,
        });
        serde_json::from_value(document)
            .map_err(|e| ConvoyError::Config(format!("invalid cluster '{}': {}", cfg.name, e)))
    }

    async fn kube_client(&self) -> Option<Client> {
        self.client.read().await.clone()
    }

    async fn dynamic_api(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        Ok(self.api(self.current_client().await?, kind, namespace))
    }
}

/// Factory producing Kubernetes-backed clients
#[derive(Default)]
pub struct KubeClientFactory;

impl ClusterClientFactory for KubeClientFactory {
    fn build(&self, cfg: &ClusterCfgInfo) -> Result<Arc<dyn ClusterClient>> {
        cfg.validate()?;
        if cfg.qps > 0.0 {
            debug!(cluster = %cfg.name, qps = cfg.qps, burst = cfg.burst, "Client-side rate limits are not enforced");
        }
        let client = KubeClusterClient::new(cfg.clone());
        // Surface malformed credentials at admission rather than at start
        if let Err(e) = client.kubeconfig() {
            error!(cluster = %cfg.name, error = %e, "Rejecting cluster definition");
            return Err(e);
        }
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployments() -> ResourceKind {
        ResourceKind::new("apps", "v1", "Deployment")
    }

    #[test]
    fn test_resource_conversion_keeps_body_and_metadata() {
        let api_resource = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let resource = Resource::new(deployments(), ObjectKey::namespaced("web", "frontend"))
            .with_label("tier", "edge")
            .with_spec(json!({ "replicas": 3 }));

        let obj = to_dynamic(&api_resource, &resource);
        assert_eq!(obj.metadata.namespace.as_deref(), Some("web"));
        assert_eq!(obj.data["spec"]["replicas"], 3);

        let back = to_resource(&deployments(), obj);
        assert_eq!(back.key, resource.key);
        assert_eq!(back.labels, resource.labels);
        assert_eq!(back.spec, resource.spec);
        assert!(back.status.is_null());
    }

    #[test]
    fn test_kubeconfig_from_cluster_definition() {
        let mut cfg = ClusterCfgInfo::new("east", "https://10.0.0.1:6443");
        cfg.token = Some("secret".to_string());
        cfg.namespace = Some("apps".to_string());
        cfg.insecure_skip_tls_verify = true;

        let kubeconfig = KubeClusterClient::new(cfg).kubeconfig().unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("east"));
        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.contexts.len(), 1);
    }

    #[test]
    fn test_replace_spec_drops_absent_fields() {
        let api_resource = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let mut obj = DynamicObject::new("frontend", &api_resource).data(json!({
            "spec": { "replicas": 3, "paused": true },
            "status": { "readyReplicas": 3 },
        }));

        replace_spec(&mut obj, json!({ "replicas": 5 }));
        assert_eq!(obj.data["spec"], json!({ "replicas": 5 }));
        assert_eq!(obj.data["status"]["readyReplicas"], 3);

        let mut bare = DynamicObject::new("bare", &api_resource);
        replace_spec(&mut bare, json!({ "replicas": 1 }));
        assert_eq!(bare.data["spec"]["replicas"], 1);
    }

    #[tokio::test]
    async fn test_raw_access_requires_running_client() {
        let client = KubeClusterClient::new(ClusterCfgInfo::new("east", "https://10.0.0.1:6443"));
        let raw = client.kubernetes().unwrap();
        assert!(raw.kube_client().await.is_none());

        let err = raw.dynamic_api(&deployments(), Some("web")).await.unwrap_err();
        assert!(err.is_not_connected());
        assert_eq!(
            raw.kubeconfig().unwrap().current_context.as_deref(),
            Some("east")
        );

        let memory = crate::service::memory::InMemoryClusterClient::new(ClusterCfgInfo::new(
            "local",
            "memory://local",
        ));
        assert!(memory.kubernetes().is_none());
    }

    #[test]
    fn test_label_selector() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "edge".to_string());
        assert_eq!(label_selector(&labels), "app=web,tier=edge");
    }

    #[test]
    fn test_relist_emits_differences() {
        let cache = KindCache::new(&deployments());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cache
            .handlers
            .write()
            .push(Arc::new(move |_: &str, event: &ResourceEvent| {
                sink.lock().push(event.clone());
            }));

        let mut kept = Resource::new(deployments(), ObjectKey::namespaced("web", "kept"));
        kept.resource_version = Some("1".to_string());
        let gone = Resource::new(deployments(), ObjectKey::namespaced("web", "gone"));
        cache.apply("east", kept.clone());
        cache.apply("east", gone);
        seen.lock().clear();

        cache.begin_relist();
        cache.relist_apply(kept);
        cache.finish_relist("east");

        let events = seen.lock().clone();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ResourceEvent::Deleted(r) if r.key.name == "gone"));
        assert!(cache.synced.load(Ordering::SeqCst));
    }
}
