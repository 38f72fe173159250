// Multi-cluster management
// Reconciles the fleet against its cluster source, admits and evicts member
// clusters, and exposes the aggregate read, fan-out and lifecycle surface

use std::{
    any::Any,
    collections::HashSet,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, future::join_all};
use tokio::sync::{Mutex, Notify, RwLock, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convoy_common::{ConvoyError, FanOutError, OP_RECONCILE, OP_STOP, Result};

use crate::model::{ClusterCfgInfo, Configuration, DuplicatePolicy, ResourceKind};

use super::{
    client::{ClusterClient, ClusterClientFactory, IndexerFunc, Predicate, ResourceEventHandler},
    cluster_event::{ClusterEvent, ClusterEventHandler, ClusterEventPublisher},
    cluster_source::{ClusterSource, create_cluster_source},
    fanout::FanOutCoordinator,
    registry::{ClusterEntry, ClusterRegistry},
    status::{self, FleetStatus},
};

/// Multi-cluster manager configuration
#[derive(Clone, Debug)]
pub struct MultiClusterManagerConfig {
    /// Interval between periodic reconciliation passes
    pub reconcile_interval: Duration,
    /// Upper bound for a member's stop routine and for its start task to exit
    pub stop_timeout: Duration,
    /// Upper bound for one admission hook
    pub hook_timeout: Duration,
    /// What to do when a cluster name is admitted twice
    pub duplicate_policy: DuplicatePolicy,
    /// Cluster event broadcast queue size
    pub event_queue_size: usize,
}

impl Default for MultiClusterManagerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
            hook_timeout: Duration::from_secs(30),
            duplicate_policy: DuplicatePolicy::Replace,
            event_queue_size: 1024,
        }
    }
}

impl MultiClusterManagerConfig {
    /// Create a MultiClusterManagerConfig from application Configuration
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            reconcile_interval: Duration::from_millis(config.reconcile_interval_ms().max(1)),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms()),
            hook_timeout: Duration::from_millis(config.hook_timeout_ms()),
            duplicate_policy: config.duplicate_policy(),
            event_queue_size: config.event_queue_size(),
        }
    }
}

/// Admission hook run before a cluster joins the fleet
///
/// `token` is the cluster's membership token, so anything the hook starts can
/// be bound to the cluster's lifetime. Returning an error vetoes admission.
#[async_trait]
pub trait BeforeStartHook: Send + Sync {
    async fn before_start(
        &self,
        token: &CancellationToken,
        client: Arc<dyn ClusterClient>,
    ) -> anyhow::Result<()>;
}

/// Adapts an async closure into a `BeforeStartHook`
pub struct FnHook<F>(F);

impl<F, Fut> FnHook<F>
where
    F: Fn(CancellationToken, Arc<dyn ClusterClient>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> BeforeStartHook for FnHook<F>
where
    F: Fn(CancellationToken, Arc<dyn ClusterClient>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn before_start(
        &self,
        token: &CancellationToken,
        client: Arc<dyn ClusterClient>,
    ) -> anyhow::Result<()> {
        (self.0)(token.clone(), client).await
    }
}

/// Multi-cluster manager
/// Central component of the fleet: membership, fan-out, status and lifecycle
#[derive(Clone)]
pub struct MultiClusterManager {
    config: MultiClusterManagerConfig,
    registry: Arc<ClusterRegistry>,
    fan_out: Arc<FanOutCoordinator>,
    source: Arc<dyn ClusterSource>,
    factory: Arc<dyn ClusterClientFactory>,
    hooks: Arc<RwLock<Vec<Arc<dyn BeforeStartHook>>>>,
    events: Arc<ClusterEventPublisher>,
    // Serializes membership changes
    membership_lock: Arc<Mutex<()>>,
    root_token: Arc<parking_lot::Mutex<CancellationToken>>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl std::fmt::Debug for MultiClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiClusterManager")
            .field("source", &self.source.source_type())
            .field("clusters", &self.registry.names())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MultiClusterManager {
    pub fn new(
        source: Arc<dyn ClusterSource>,
        factory: Arc<dyn ClusterClientFactory>,
    ) -> Self {
        Self::with_config(source, factory, MultiClusterManagerConfig::default())
    }

    pub fn with_config(
        source: Arc<dyn ClusterSource>,
        factory: Arc<dyn ClusterClientFactory>,
        config: MultiClusterManagerConfig,
    ) -> Self {
        let registry = Arc::new(ClusterRegistry::new(config.duplicate_policy));
        let fan_out = Arc::new(FanOutCoordinator::new(registry.clone()));
        let events = Arc::new(ClusterEventPublisher::new(config.event_queue_size));

        Self {
            config,
            registry,
            fan_out,
            source,
            factory,
            hooks: Arc::new(RwLock::new(Vec::new())),
            events,
            membership_lock: Arc::new(Mutex::new(())),
            root_token: Arc::new(parking_lot::Mutex::new(CancellationToken::new())),
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Build a manager whose source and timings come from `config`
    pub fn from_configuration(
        config: &Configuration,
        factory: Arc<dyn ClusterClientFactory>,
    ) -> Result<Self> {
        let source = create_cluster_source(config)?;
        Ok(Self::with_config(
            source,
            factory,
            MultiClusterManagerConfig::from_configuration(config),
        ))
    }

    pub fn config(&self) -> &MultiClusterManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    // ===================== Membership =====================

    /// Register an admission hook; hooks run in registration order
    pub async fn register_before_start_hook(&self, hook: Arc<dyn BeforeStartHook>) {
        let mut hooks = self.hooks.write().await;
        hooks.push(hook);
        debug!("Registered before-start hook, total: {}", hooks.len());
    }

    /// Subscribe an observer to cluster add/delete
    pub async fn add_cluster_event_handler(&self, handler: Arc<dyn ClusterEventHandler>) {
        self.events.register_handler(handler).await;
    }

    /// Subscribe to cluster change events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Reconcile the registry against the cluster source once
    ///
    /// Clusters missing from the source are evicted, new ones admitted and
    /// reconfigured ones replaced. One cluster's failure never stops the pass:
    /// a single failure is returned as is, several as a `FanOut` aggregate.
    pub async fn fetch_client_info_once(&self) -> Result<()> {
        self.reconcile(None).await
    }

    async fn reconcile(&self, fleet: Option<&CancellationToken>) -> Result<()> {
        let _membership = self.membership_lock.lock().await;
        // A pass queued behind stop() must not re-admit the drained fleet
        if fleet.is_some_and(|fleet| fleet.is_cancelled()) {
            debug!("Fleet stopped, skipping reconciliation pass");
            return Ok(());
        }

        let desired = self.source.fetch().await?;
        let desired_names: HashSet<&str> = desired.iter().map(|c| c.name.as_str()).collect();
        let mut failures = FanOutError::new(OP_RECONCILE);

        for entry in self.registry.entries() {
            if !desired_names.contains(entry.name()) {
                info!(cluster = %entry.name(), "Cluster no longer desired, evicting");
                if let Err(e) = self.evict(entry.name()).await {
                    failures.push(entry.name(), e);
                }
            }
        }

        for cfg in &desired {
            match self.registry.get_entry(&cfg.name) {
                Ok(existing) if existing.cfg_info() == cfg => continue,
                Ok(_) => {
                    info!(cluster = %cfg.name, "Cluster configuration changed, replacing");
                    if let Err(e) = self.evict(&cfg.name).await {
                        failures.push(cfg.name.as_str(), e);
                    }
                }
                Err(_) => {}
            }

            if let Err(e) = self.admit(cfg.clone()).await {
                warn!(cluster = %cfg.name, error = %e, "Cluster admission failed");
                failures.push(cfg.name.as_str(), e);
            }
        }

        debug!(
            clusters = self.registry.len(),
            failed = failures.failures.len(),
            "Reconciliation pass finished"
        );

        match failures.failures.len() {
            0 => Ok(()),
            1 => {
                let (_, error) = failures.failures.remove(0);
                Err(error)
            }
            _ => Err(ConvoyError::FanOut(failures)),
        }
    }

    /// Admit one cluster outside of reconciliation
    pub async fn add_cluster(&self, cfg: ClusterCfgInfo) -> Result<()> {
        let _membership = self.membership_lock.lock().await;

        if self.registry.contains(&cfg.name) {
            match self.config.duplicate_policy {
                DuplicatePolicy::Reject => {
                    return Err(ConvoyError::DuplicateCluster(cfg.name.clone()));
                }
                DuplicatePolicy::Replace => {
                    info!(cluster = %cfg.name, "Replacing registered cluster");
                    if let Err(e) = self.evict(&cfg.name).await {
                        warn!(cluster = %cfg.name, error = %e, "Replaced cluster did not stop cleanly");
                    }
                }
            }
        }

        self.admit(cfg).await
    }

    /// Evict one cluster outside of reconciliation
    pub async fn remove_cluster(&self, name: &str) -> Result<()> {
        let _membership = self.membership_lock.lock().await;
        self.evict(name).await
    }

    /// Wake the reconciliation loop of a running fleet
    pub fn trigger_reconcile(&self) {
        self.wake.notify_one();
    }

    fn fleet_token(&self) -> CancellationToken {
        let mut root = self.root_token.lock();
        if root.is_cancelled() {
            *root = CancellationToken::new();
        }
        root.clone()
    }

    async fn admit(&self, cfg: ClusterCfgInfo) -> Result<()> {
        cfg.validate()?;
        let client = self.factory.build(&cfg)?;
        let token = self.fleet_token().child_token();

        if let Err(e) = self.run_hooks(&cfg.name, &token, &client).await {
            token.cancel();
            return Err(e);
        }

        let entry = Arc::new(ClusterEntry::new(client.clone(), token.clone()));
        let replaced = match self.fan_out.admit(entry.clone()).await {
            Ok(replaced) => replaced,
            Err(e) => {
                token.cancel();
                if tokio::time::timeout(self.config.stop_timeout, client.stop())
                    .await
                    .is_err()
                {
                    warn!(cluster = %cfg.name, "Rejected client did not stop in time");
                }
                return Err(e);
            }
        };

        // Only reachable when an admission raced past the duplicate check
        if let Some(old) = replaced {
            warn!(cluster = %old.name(), "Stopping cluster replaced during admission");
            if let Err(e) = self.shutdown_entry(&old).await {
                warn!(cluster = %old.name(), error = %e, "Replaced cluster did not stop cleanly");
            }
            self.events
                .publish(
                    ClusterEvent::deleted(old.name(), &old.cfg_info().endpoint),
                    old.token(),
                    old.client(),
                )
                .await;
        }

        let (admitted_tx, admitted_rx) = oneshot::channel();
        self.spawn_start(entry.clone(), admitted_rx);
        info!(cluster = %cfg.name, endpoint = %cfg.endpoint, "Cluster admitted");

        self.events
            .publish(
                ClusterEvent::added(&cfg.name, &cfg.endpoint),
                entry.token(),
                entry.client(),
            )
            .await;
        let _ = admitted_tx.send(());
        Ok(())
    }

    async fn run_hooks(
        &self,
        cluster: &str,
        token: &CancellationToken,
        client: &Arc<dyn ClusterClient>,
    ) -> Result<()> {
        let hooks: Vec<Arc<dyn BeforeStartHook>> = self.hooks.read().await.clone();
        for (index, hook) in hooks.iter().enumerate() {
            let call = AssertUnwindSafe(hook.before_start(token, client.clone())).catch_unwind();
            let outcome = tokio::select! {
                result = tokio::time::timeout(self.config.hook_timeout, call) => match result {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(panic)) => Err(anyhow::anyhow!(
                        "hook panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                    Err(_) => Err(anyhow::anyhow!(
                        "timed out after {:?}",
                        self.config.hook_timeout
                    )),
                },
                _ = token.cancelled() => Err(anyhow::anyhow!("admission cancelled")),
            };

            if let Err(source) = outcome {
                warn!(cluster, hook = index, error = %source, "Before-start hook rejected cluster");
                return Err(ConvoyError::AdmissionHook {
                    cluster: cluster.to_string(),
                    hook: index,
                    source,
                });
            }
        }
        Ok(())
    }

    fn spawn_start(&self, entry: Arc<ClusterEntry>, admitted: oneshot::Receiver<()>) {
        let manager = self.clone();
        let task_entry = entry.clone();

        let handle = tokio::spawn(async move {
            let outcome = task_entry
                .client()
                .start(task_entry.token().clone())
                .await;

            if task_entry.token().is_cancelled() {
                if let Err(e) = outcome {
                    debug!(cluster = %task_entry.name(), error = %e, "Cluster client exited with error after cancellation");
                }
                return;
            }

            match &outcome {
                Err(e) => error!(cluster = %task_entry.name(), error = %e, "Cluster client failed"),
                Ok(()) => warn!(cluster = %task_entry.name(), "Cluster client exited unexpectedly"),
            }

            // Keep add/delete notifications ordered
            let _ = admitted.await;

            if manager.registry.remove_if_same(&task_entry) {
                // Detach our own handle so shutdown does not wait on this task
                drop(task_entry.take_task());
                if let Err(e) = manager.shutdown_entry(&task_entry).await {
                    warn!(cluster = %task_entry.name(), error = %e, "Failed cluster did not stop cleanly");
                }
                manager
                    .events
                    .publish(
                        ClusterEvent::deleted(task_entry.name(), &task_entry.cfg_info().endpoint),
                        task_entry.token(),
                        task_entry.client(),
                    )
                    .await;
                info!(cluster = %task_entry.name(), "Cluster evicted after client failure, will be re-admitted on next reconcile");
            }
        });

        entry.set_task(handle);
    }

    async fn evict(&self, name: &str) -> Result<()> {
        let entry = self.registry.remove(name)?;
        info!(cluster = %name, "Evicting cluster");

        let result = self.shutdown_entry(&entry).await;
        self.events
            .publish(
                ClusterEvent::deleted(entry.name(), &entry.cfg_info().endpoint),
                entry.token(),
                entry.client(),
            )
            .await;
        result
    }

    /// Cancel, stop and join one already-unregistered entry
    async fn shutdown_entry(&self, entry: &Arc<ClusterEntry>) -> Result<()> {
        entry.token().cancel();

        let mut result = Ok(());
        if tokio::time::timeout(self.config.stop_timeout, entry.client().stop())
            .await
            .is_err()
        {
            warn!(cluster = %entry.name(), "Cluster client stop timed out");
            result = Err(ConvoyError::Stop {
                cluster: entry.name().to_string(),
                reason: format!("stop timed out after {:?}", self.config.stop_timeout),
            });
        }

        if let Some(mut handle) = entry.take_task() {
            match tokio::time::timeout(self.config.stop_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(cluster = %entry.name(), error = %e, "Cluster start task ended abnormally");
                }
                Err(_) => {
                    handle.abort();
                    warn!(cluster = %entry.name(), "Cluster start task did not exit, aborted");
                    if result.is_ok() {
                        result = Err(ConvoyError::Stop {
                            cluster: entry.name().to_string(),
                            reason: "start task did not exit after cancellation".to_string(),
                        });
                    }
                }
            }
        }

        result
    }

    // ===================== Read path =====================

    pub fn get_with_name(&self, name: &str) -> Result<Arc<dyn ClusterClient>> {
        self.registry.get_with_name(name)
    }

    pub fn get_connected_with_name(&self, name: &str) -> Result<Arc<dyn ClusterClient>> {
        self.registry.get_connected_with_name(name)
    }

    pub fn get_all(&self) -> Vec<Arc<dyn ClusterClient>> {
        self.registry.get_all()
    }

    pub fn get_all_connected(&self) -> Vec<Arc<dyn ClusterClient>> {
        self.registry.get_all_connected()
    }

    pub fn cluster_count(&self) -> usize {
        self.registry.len()
    }

    /// True when every member has synced; also true with no members
    pub fn has_synced(&self) -> bool {
        status::has_synced(&self.registry.get_all())
    }

    pub fn status(&self) -> FleetStatus {
        FleetStatus::from_clients(&self.registry.get_all())
    }

    // ===================== Fan-out =====================

    pub async fn add_resource_event_handler(
        &self,
        kind: ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        self.fan_out.add_resource_event_handler(kind, handler).await
    }

    pub async fn set_index_field(
        &self,
        kind: ResourceKind,
        field: &str,
        extractor: IndexerFunc,
    ) -> Result<()> {
        self.fan_out.set_index_field(kind, field, extractor).await
    }

    pub async fn trigger_sync(&self, kind: ResourceKind) -> Result<()> {
        self.fan_out.trigger_sync(kind).await
    }

    pub async fn watch(
        &self,
        kind: ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
        predicates: Vec<Predicate>,
    ) -> Result<()> {
        self.fan_out.watch(kind, handler, predicates).await
    }

    // ===================== Lifecycle =====================

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the fleet until `token` is cancelled or `stop` is called
    ///
    /// Reconciles on start, then periodically and whenever
    /// `trigger_reconcile` is called. Every member is stopped before return,
    /// also when a reconciliation pass panics; the panic is then resumed.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConvoyError::AlreadyRunning);
        }
        let fleet = self.fleet_token();

        info!(
            source = ?self.source.source_type(),
            interval = ?self.config.reconcile_interval,
            "Starting multi-cluster manager"
        );

        let outcome = AssertUnwindSafe(self.run_reconcile_loop(&token, &fleet))
            .catch_unwind()
            .await;

        info!("Multi-cluster manager shutting down");
        let stopped = self.stop().await;

        if let Err(panic) = outcome {
            error!(
                reason = panic_message(panic.as_ref()),
                "Reconciliation loop panicked, fleet stopped"
            );
            std::panic::resume_unwind(panic);
        }
        stopped
    }

    async fn run_reconcile_loop(&self, token: &CancellationToken, fleet: &CancellationToken) {
        if let Err(e) = self.reconcile(Some(fleet)).await {
            warn!(error = %e, "Initial reconciliation failed");
        }

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = fleet.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.reconcile(Some(fleet)).await {
                warn!(error = %e, "Reconciliation failed");
            }
        }
    }

    /// Stop every member and release the fleet
    ///
    /// Every member is attempted even when some fail; failures are returned
    /// as a `FanOut` aggregate. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.root_token.lock().cancel();

        let _membership = self.membership_lock.lock().await;
        let entries = self.registry.drain();
        if entries.is_empty() {
            if was_running {
                info!("Multi-cluster manager stopped");
            }
            return Ok(());
        }

        info!("Stopping {} member clusters", entries.len());
        let results = join_all(entries.iter().map(|entry| self.shutdown_entry(entry))).await;

        let mut failures = FanOutError::new(OP_STOP);
        for (entry, result) in entries.iter().zip(results) {
            if let Err(e) = result {
                failures.push(entry.name(), e);
            }
            self.events
                .publish(
                    ClusterEvent::deleted(entry.name(), &entry.cfg_info().endpoint),
                    entry.token(),
                    entry.client(),
                )
                .await;
        }

        info!("Multi-cluster manager stopped");
        failures.into_result()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
