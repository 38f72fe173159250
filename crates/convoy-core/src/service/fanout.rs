// Fan-out coordinator
// Applies fleet-wide registrations to every current member and replays them
// onto members admitted later

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use convoy_common::{
    ConvoyError, FanOutError, OP_ADD_RESOURCE_EVENT_HANDLER, OP_SET_INDEX_FIELD, OP_TRIGGER_SYNC,
    OP_WATCH, Result,
};

use crate::model::ResourceKind;

use super::{
    client::{ClusterClient, FilteredHandler, IndexerFunc, Predicate, ResourceEventHandler},
    registry::{ClusterEntry, ClusterRegistry},
};

/// One fleet-wide registration
#[derive(Clone)]
pub enum Registration {
    EventHandler {
        kind: ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    },
    IndexField {
        kind: ResourceKind,
        field: String,
        extractor: IndexerFunc,
    },
    /// Informer warm-up recorded by `trigger_sync`
    Informer { kind: ResourceKind },
}

impl Registration {
    pub fn kind(&self) -> &ResourceKind {
        match self {
            Registration::EventHandler { kind, .. }
            | Registration::IndexField { kind, .. }
            | Registration::Informer { kind } => kind,
        }
    }

    /// Apply this registration to one client
    pub async fn apply(&self, client: &dyn ClusterClient) -> Result<()> {
        match self {
            Registration::EventHandler { kind, handler } => {
                client.add_resource_event_handler(kind, handler.clone()).await
            }
            Registration::IndexField {
                kind,
                field,
                extractor,
            } => client.set_index_field(kind, field, extractor.clone()).await,
            Registration::Informer { kind } => client.get_informer(kind).await,
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Registration::EventHandler { kind, .. } => {
                f.debug_struct("EventHandler").field("kind", kind).finish()
            }
            Registration::IndexField { kind, field, .. } => f
                .debug_struct("IndexField")
                .field("kind", kind)
                .field("field", field)
                .finish(),
            Registration::Informer { kind } => {
                f.debug_struct("Informer").field("kind", kind).finish()
            }
        }
    }
}

/// Fan-out coordinator
///
/// Registrations are appended to an ordered log and never removed. The log
/// lock is held while a registration is applied to the current members and
/// while a joining member is replayed and inserted, so every registration
/// reaches every member exactly once.
pub struct FanOutCoordinator {
    registry: Arc<ClusterRegistry>,
    log: Mutex<Vec<Registration>>,
}

impl FanOutCoordinator {
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self {
            registry,
            log: Mutex::new(Vec::new()),
        }
    }

    pub async fn add_resource_event_handler(
        &self,
        kind: ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
    ) -> Result<()> {
        self.register(
            OP_ADD_RESOURCE_EVENT_HANDLER,
            Registration::EventHandler { kind, handler },
        )
        .await
    }

    pub async fn set_index_field(
        &self,
        kind: ResourceKind,
        field: &str,
        extractor: IndexerFunc,
    ) -> Result<()> {
        self.register(
            OP_SET_INDEX_FIELD,
            Registration::IndexField {
                kind,
                field: field.to_string(),
                extractor,
            },
        )
        .await
    }

    /// Warm the informer cache for `kind` on every member
    pub async fn trigger_sync(&self, kind: ResourceKind) -> Result<()> {
        self.register(OP_TRIGGER_SYNC, Registration::Informer { kind })
            .await
    }

    /// Register `handler` behind `predicates` on every member
    pub async fn watch(
        &self,
        kind: ResourceKind,
        handler: Arc<dyn ResourceEventHandler>,
        predicates: Vec<Predicate>,
    ) -> Result<()> {
        let handler: Arc<dyn ResourceEventHandler> =
            Arc::new(FilteredHandler::new(handler, predicates));
        self.register(OP_WATCH, Registration::EventHandler { kind, handler })
            .await
    }

    /// Number of recorded registrations
    pub async fn registrations(&self) -> usize {
        self.log.lock().await.len()
    }

    async fn register(&self, operation: &str, registration: Registration) -> Result<()> {
        let mut log = self.log.lock().await;
        // One informer record per kind is enough for replay
        let recorded = matches!(registration, Registration::Informer { .. })
            && log.iter().any(|r| {
                matches!(r, Registration::Informer { .. }) && r.kind() == registration.kind()
            });
        if !recorded {
            log.push(registration.clone());
        }

        let entries = self.registry.entries();
        debug!(
            operation,
            kind = %registration.kind(),
            clusters = entries.len(),
            "Fanning out registration"
        );

        let mut failures = FanOutError::new(operation);
        for entry in entries {
            if let Err(e) = registration.apply(entry.client().as_ref()).await {
                warn!(
                    cluster = %entry.name(),
                    operation,
                    error = %e,
                    "Fan-out registration failed"
                );
                failures.push(entry.name(), e);
            }
        }
        drop(log);

        failures.into_result()
    }

    /// Replay every registration onto `entry`, then insert it into the registry
    ///
    /// Returns the entry replaced by the insert, if any. A replay failure
    /// aborts the admission and leaves the registry untouched.
    pub async fn admit(&self, entry: Arc<ClusterEntry>) -> Result<Option<Arc<ClusterEntry>>> {
        let log = self.log.lock().await;

        for (index, registration) in log.iter().enumerate() {
            if let Err(e) = registration.apply(entry.client().as_ref()).await {
                return Err(ConvoyError::Start {
                    cluster: entry.name().to_string(),
                    reason: format!(
                        "replay of registration #{} ({:?}) failed: {}",
                        index, registration, e
                    ),
                });
            }
        }

        let replaced = self.registry.add(entry.clone())?;
        info!(
            cluster = %entry.name(),
            replayed = log.len(),
            "Cluster registered with replayed registrations"
        );
        Ok(replaced)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::model::{ClusterCfgInfo, ResourceEvent};
    use crate::service::memory::{ClientFaults, InMemoryClusterClient};

    fn pods() -> ResourceKind {
        ResourceKind::core("v1", "Pod")
    }

    fn entry_with(name: &str, faults: ClientFaults) -> (Arc<ClusterEntry>, Arc<InMemoryClusterClient>) {
        let client = Arc::new(InMemoryClusterClient::with_faults(
            ClusterCfgInfo::new(name, "memory://local"),
            faults,
        ));
        let entry = Arc::new(ClusterEntry::new(client.clone(), CancellationToken::new()));
        (entry, client)
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn ResourceEventHandler> {
        Arc::new(move |_: &str, _: &ResourceEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_registration_applies_to_current_and_future_members() {
        let registry = Arc::new(ClusterRegistry::default());
        let fan_out = FanOutCoordinator::new(registry.clone());

        let (first, first_client) = entry_with("first", ClientFaults::default());
        fan_out.admit(first).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        fan_out
            .add_resource_event_handler(pods(), counting_handler(counter))
            .await
            .unwrap();
        assert_eq!(first_client.handler_count(&pods()), 1);

        let (second, second_client) = entry_with("second", ClientFaults::default());
        fan_out.admit(second).await.unwrap();
        assert_eq!(second_client.handler_count(&pods()), 1);
        assert_eq!(first_client.handler_count(&pods()), 1);
        assert_eq!(fan_out.registrations().await, 1);
    }

    #[tokio::test]
    async fn test_trigger_sync_with_no_members_succeeds() {
        let fan_out = FanOutCoordinator::new(Arc::new(ClusterRegistry::default()));
        assert!(fan_out.trigger_sync(pods()).await.is_ok());
    }

    #[tokio::test]
    async fn test_repeated_trigger_sync_records_once() {
        let registry = Arc::new(ClusterRegistry::default());
        let fan_out = FanOutCoordinator::new(registry.clone());
        let (member, client) = entry_with("member", ClientFaults::default());
        fan_out.admit(member).await.unwrap();

        fan_out.trigger_sync(pods()).await.unwrap();
        fan_out.trigger_sync(pods()).await.unwrap();
        assert_eq!(fan_out.registrations().await, 1);
        assert!(client.has_informer(&pods()));

        fan_out
            .trigger_sync(ResourceKind::core("v1", "Service"))
            .await
            .unwrap();
        assert_eq!(fan_out.registrations().await, 2);

        let (late, late_client) = entry_with("late", ClientFaults::default());
        fan_out.admit(late).await.unwrap();
        assert!(late_client.has_informer(&pods()));
        assert!(late_client.has_informer(&ResourceKind::core("v1", "Service")));
    }

    #[tokio::test]
    async fn test_partial_failure_names_failing_cluster() {
        let registry = Arc::new(ClusterRegistry::default());
        let fan_out = FanOutCoordinator::new(registry.clone());

        let (good, good_client) = entry_with("good", ClientFaults::default());
        let (bad, _) = entry_with(
            "bad",
            ClientFaults {
                fail_index: Some("forbidden".to_string()),
                ..Default::default()
            },
        );
        fan_out.admit(good).await.unwrap();
        fan_out.admit(bad).await.unwrap();

        let extractor: IndexerFunc = Arc::new(|r: &crate::model::Resource| vec![r.key.name.clone()]);
        let err = fan_out
            .set_index_field(pods(), "name", extractor)
            .await
            .unwrap_err();

        match err {
            ConvoyError::FanOut(fan_out_err) => {
                assert_eq!(fan_out_err.operation, OP_SET_INDEX_FIELD);
                assert_eq!(fan_out_err.cluster_names(), vec!["bad"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(good_client.index_fields(&pods()), vec!["name".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_failure_aborts_admission() {
        let registry = Arc::new(ClusterRegistry::default());
        let fan_out = FanOutCoordinator::new(registry.clone());
        fan_out.trigger_sync(pods()).await.unwrap();

        let (bad, _) = entry_with(
            "bad",
            ClientFaults {
                fail_informer: Some("no rbac".to_string()),
                ..Default::default()
            },
        );
        let err = fan_out.admit(bad).await.unwrap_err();
        assert!(matches!(err, ConvoyError::Start { ref cluster, .. } if cluster == "bad"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_watch_filters_events() {
        let registry = Arc::new(ClusterRegistry::default());
        let fan_out = FanOutCoordinator::new(registry.clone());
        let (member, client) = entry_with("member", ClientFaults::default());
        fan_out.admit(member).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let only_deletes: Predicate =
            Arc::new(|e: &ResourceEvent| matches!(e, ResourceEvent::Deleted(_)));
        fan_out
            .watch(pods(), counting_handler(counter.clone()), vec![only_deletes])
            .await
            .unwrap();

        use crate::service::client::ResourceOperate;
        let key = crate::model::ObjectKey::namespaced("default", "p");
        client
            .create(crate::model::Resource::new(pods(), key.clone()))
            .await
            .unwrap();
        client.delete(&pods(), &key).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
