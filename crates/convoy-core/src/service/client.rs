// Single-cluster client contract
// The capability groups a per-cluster client exposes, kept as narrow traits so
// a client (or a test double) implements only what it is asked to provide

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use convoy_common::Result;

use crate::model::{ClusterCfgInfo, ListOptions, ObjectKey, Patch, Resource, ResourceEvent, ResourceKind};

/// Receives informer events for one resource kind
///
/// Events for a single handler on a single cluster are delivered in order.
/// There is no ordering between clusters.
pub trait ResourceEventHandler: Send + Sync {
    fn on_event(&self, cluster: &str, event: &ResourceEvent);
}

impl<F> ResourceEventHandler for F
where
    F: Fn(&str, &ResourceEvent) + Send + Sync,
{
    fn on_event(&self, cluster: &str, event: &ResourceEvent) {
        self(cluster, event)
    }
}

/// Extracts the index values of one field from a resource
pub type IndexerFunc = Arc<dyn Fn(&Resource) -> Vec<String> + Send + Sync>;

/// Event filter used by `watch`; an event passes when every predicate accepts it
pub type Predicate = Arc<dyn Fn(&ResourceEvent) -> bool + Send + Sync>;

/// Handler that forwards only the events accepted by all of its predicates
pub struct FilteredHandler {
    inner: Arc<dyn ResourceEventHandler>,
    predicates: Vec<Predicate>,
}

impl FilteredHandler {
    pub fn new(inner: Arc<dyn ResourceEventHandler>, predicates: Vec<Predicate>) -> Self {
        Self { inner, predicates }
    }
}

impl ResourceEventHandler for FilteredHandler {
    fn on_event(&self, cluster: &str, event: &ResourceEvent) {
        if self.predicates.iter().all(|p| p(event)) {
            self.inner.on_event(cluster, event);
        }
    }
}

/// Resource CRUD against one cluster
#[async_trait]
pub trait ResourceOperate: Send + Sync {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<Resource>;

    async fn create(&self, resource: Resource) -> Result<Resource>;

    async fn update(&self, resource: Resource) -> Result<Resource>;

    /// Update only the status of `resource`
    async fn status_update(&self, resource: Resource) -> Result<Resource>;

    async fn delete(&self, kind: &ResourceKind, key: &ObjectKey) -> Result<()>;

    async fn patch(&self, kind: &ResourceKind, key: &ObjectKey, patch: Patch) -> Result<Resource>;

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<Resource>>;

    /// Delete every resource of `kind` matching `options`, returning how many were removed
    async fn delete_all_of(&self, kind: &ResourceKind, options: &ListOptions) -> Result<usize>;
}

/// Informer, handler and index registration for one cluster
#[async_trait]
pub trait Informers: Send + Sync {
    /// Fetch or construct the informer for `kind`, warming its cache
    async fn get_informer(&self, kind: &ResourceKind) -> Result<()>;

    /// Register `handler` on the informer for `kind`, creating it if needed
    async fn add_resource_event_handler(
        &self,
        kind: &ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()>;

    /// Index `kind` by `field`, using `extractor` to compute the values
    async fn set_index_field(
        &self,
        kind: &ResourceKind,
        field: &str,
        extractor: IndexerFunc,
    ) -> Result<()>;

    /// True once every informer's store has synced; true with no informers
    fn has_synced(&self) -> bool;
}

/// Start/stop and connectivity of one cluster
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    /// Run the client until `token` is cancelled
    async fn start(&self, token: CancellationToken) -> Result<()>;

    /// Release the client's resources; `start` must return soon after
    async fn stop(&self);

    fn is_connected(&self) -> bool;

    fn cluster_cfg_info(&self) -> ClusterCfgInfo;

    /// Raw Kubernetes access, for clients that talk to a real API server
    #[cfg(feature = "kube")]
    fn kubernetes(&self) -> Option<&dyn KubernetesResource> {
        None
    }
}

/// Escape hatch to the Kubernetes API behind a cluster client
///
/// Covers calls the fleet resource model does not express. Clients exist
/// only while the cluster is connected.
#[cfg(feature = "kube")]
#[async_trait]
pub trait KubernetesResource: Send + Sync {
    /// Kubeconfig describing exactly this cluster
    fn kubeconfig(&self) -> Result<kube::config::Kubeconfig>;

    /// API client of the running cluster; `None` before start and after stop
    async fn kube_client(&self) -> Option<kube::Client>;

    /// Untyped API handle for `kind`, cluster-wide when `namespace` is `None`
    async fn dynamic_api(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<kube::Api<kube::api::DynamicObject>>;
}

/// A complete single-cluster client
pub trait ClusterClient: ResourceOperate + Informers + Lifecycle {}

impl<T> ClusterClient for T where T: ResourceOperate + Informers + Lifecycle {}

/// Builds a client from a cluster configuration snapshot
pub trait ClusterClientFactory: Send + Sync {
    fn build(&self, cfg: &ClusterCfgInfo) -> Result<Arc<dyn ClusterClient>>;
}
