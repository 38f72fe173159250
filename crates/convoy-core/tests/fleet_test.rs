// Integration tests for MultiClusterManager
// Drives the fleet end to end over in-memory clusters

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use convoy_core::{
    ClusterCfgInfo, ConvoyError, ObjectKey, Resource, ResourceEvent, ResourceKind,
    fleet::{FnHook, MultiClusterManager, MultiClusterManagerConfig},
    service::{
        ClusterChangeType, ClusterClient, ClusterEntry, ClusterEventHandler, ClusterRegistry,
        Informers, ResourceEventHandler, ResourceOperate,
        cluster_source::{FileClusterSource, StaticClusterSource},
        memory::{ClientFaults, InMemoryClientFactory, InMemoryClusterClient},
    },
};

fn pods() -> ResourceKind {
    ResourceKind::core("v1", "Pod")
}

fn cluster(name: &str) -> ClusterCfgInfo {
    ClusterCfgInfo::new(name, &format!("memory://{}", name))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fleet(
    clusters: Vec<ClusterCfgInfo>,
    factory: InMemoryClientFactory,
) -> (MultiClusterManager, Arc<StaticClusterSource>, Arc<InMemoryClientFactory>) {
    init_tracing();
    let source = Arc::new(StaticClusterSource::new(clusters));
    let factory = Arc::new(factory);
    let config = MultiClusterManagerConfig {
        reconcile_interval: Duration::from_secs(60),
        stop_timeout: Duration::from_millis(500),
        hook_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let manager = MultiClusterManager::with_config(source.clone(), factory.clone(), config);
    (manager, source, factory)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Default)]
struct Observer {
    added: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ClusterEventHandler for Observer {
    async fn on_add(&self, _token: &CancellationToken, client: Arc<dyn ClusterClient>) {
        self.added.lock().push(client.name().to_string());
    }

    async fn on_delete(&self, _token: &CancellationToken, client: Arc<dyn ClusterClient>) {
        self.deleted.lock().push(client.name().to_string());
    }
}

#[tokio::test]
async fn test_handler_registered_first_fires_on_every_later_cluster() {
    let seed = vec![Resource::new(pods(), ObjectKey::namespaced("default", "web-0"))];
    let (manager, source, factory) = fleet(vec![], InMemoryClientFactory::with_seed(seed));

    let observed = Arc::new(Mutex::new(BTreeSet::new()));
    let sink = observed.clone();
    let handler: Arc<dyn ResourceEventHandler> =
        Arc::new(move |cluster: &str, _event: &ResourceEvent| {
            sink.lock().insert(cluster.to_string());
        });
    manager
        .add_resource_event_handler(pods(), handler)
        .await
        .unwrap();

    source.set(vec![cluster("a"), cluster("b"), cluster("c")]);
    manager.fetch_client_info_once().await.unwrap();

    let expected: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(*observed.lock(), expected);
    for name in ["a", "b", "c"] {
        assert_eq!(factory.client(name).unwrap().handler_count(&pods()), 1);
    }

    // Later events still reach the replayed handler
    observed.lock().clear();
    let b = manager.get_with_name("b").unwrap();
    b.create(Resource::new(pods(), ObjectKey::namespaced("default", "web-1")))
        .await
        .unwrap();
    assert_eq!(observed.lock().iter().collect::<Vec<_>>(), vec!["b"]);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_eviction_semantics() {
    let (manager, _source, _factory) = fleet(vec![], InMemoryClientFactory::new());

    assert!(manager.remove_cluster("ghost").await.unwrap_err().is_not_found());

    manager.add_cluster(cluster("east")).await.unwrap();
    wait_until("east to connect", || {
        manager.get_connected_with_name("east").is_ok()
    })
    .await;

    manager.remove_cluster("east").await.unwrap();
    assert!(manager.get_all().is_empty());
    let err = manager.get_connected_with_name("east").err().expect("expected lookup of removed cluster to fail");
    assert!(err.is_not_found() || err.is_not_connected());
}

#[tokio::test]
async fn test_failing_admission_hook_keeps_cluster_out() {
    let (manager, _source, factory) = fleet(vec![cluster("east")], InMemoryClientFactory::new());
    manager
        .register_before_start_hook(Arc::new(FnHook::new(
            |_token: CancellationToken, _client: Arc<dyn ClusterClient>| async {
                Err::<(), anyhow::Error>(anyhow::anyhow!("policy check failed"))
            },
        )))
        .await;

    let err = manager.fetch_client_info_once().await.unwrap_err();
    assert!(err.is_admission_hook());
    assert!(matches!(err, ConvoyError::AdmissionHook { ref cluster, hook: 0, .. } if cluster == "east"));
    assert!(manager.get_all().is_empty());
    assert_eq!(factory.client("east").unwrap().start_count(), 0);
}

#[tokio::test]
async fn test_hook_sees_cluster_before_it_is_visible() {
    let (manager, _source, _factory) = fleet(vec![cluster("east")], InMemoryClientFactory::new());
    let visible_during_hook = Arc::new(AtomicUsize::new(usize::MAX));
    let probe = manager.clone();
    let record = visible_during_hook.clone();
    manager
        .register_before_start_hook(Arc::new(FnHook::new(
            move |_token: CancellationToken, _client: Arc<dyn ClusterClient>| {
                let probe = probe.clone();
                let record = record.clone();
                async move {
                    record.store(probe.get_all().len(), Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            },
        )))
        .await;

    manager.fetch_client_info_once().await.unwrap();
    assert_eq!(visible_during_hook.load(Ordering::SeqCst), 0);
    assert_eq!(manager.cluster_count(), 1);
    manager.stop().await.unwrap();
}

#[test]
fn test_concurrent_reads_see_consistent_snapshots() {
    const N: usize = 16;
    let registry = Arc::new(ClusterRegistry::default());
    let entries: Vec<Arc<ClusterEntry>> = (0..N)
        .map(|i| {
            let client = Arc::new(InMemoryClusterClient::new(cluster(&format!("c{:02}", i))));
            Arc::new(ClusterEntry::new(client, CancellationToken::new()))
        })
        .collect();

    // A single writer adds c00..c15 in order, then removes them in order, so
    // every consistent state is a prefix or a suffix of the name range
    let valid = |names: &BTreeSet<usize>| {
        let Some(&min) = names.iter().next() else {
            return true;
        };
        let max = *names.iter().next_back().unwrap_or(&min);
        names.len() == max - min + 1 && (min == 0 || max == N - 1)
    };

    std::thread::scope(|scope| {
        let writer_registry = registry.clone();
        let writer = scope.spawn(move || {
            for _ in 0..50 {
                for entry in &entries {
                    writer_registry.add(entry.clone()).unwrap();
                }
                for entry in &entries {
                    writer_registry.remove(entry.name()).unwrap();
                }
            }
        });

        for _ in 0..4 {
            let reader_registry = registry.clone();
            scope.spawn(move || {
                for _ in 0..2_000 {
                    let names: BTreeSet<usize> = reader_registry
                        .get_all()
                        .iter()
                        .map(|c| c.name()[1..].parse::<usize>().unwrap())
                        .collect();
                    assert!(valid(&names), "inconsistent snapshot: {:?}", names);
                }
            });
        }

        writer.join().unwrap();
    });

    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_trigger_sync_vacuous_and_partial_failure() {
    let (manager, _source, factory) =
        fleet(vec![cluster("good"), cluster("bad")], InMemoryClientFactory::new());

    assert!(manager.trigger_sync(pods()).await.is_ok());

    factory.set_faults(
        "bad",
        ClientFaults {
            fail_informer: Some("forbidden".to_string()),
            ..Default::default()
        },
    );
    // The Pod informer replay fails on "bad", so it never joins
    let err = manager.fetch_client_info_once().await.unwrap_err();
    assert!(matches!(err, ConvoyError::Start { ref cluster, .. } if cluster == "bad"));
    assert_eq!(manager.registry().names(), vec!["good"]);

    manager.add_cluster(cluster("late")).await.unwrap();
    factory
        .client("late")
        .unwrap()
        .set_faults(ClientFaults {
            fail_informer: Some("forbidden".to_string()),
            ..Default::default()
        });
    wait_until("members to connect", || manager.status().connected == 2).await;

    let kind = ResourceKind::new("apps", "v1", "Deployment");
    let err = manager.trigger_sync(kind.clone()).await.unwrap_err();
    match err {
        ConvoyError::FanOut(fan_out) => assert_eq!(fan_out.cluster_names(), vec!["late"]),
        other => panic!("unexpected error: {other}"),
    }

    let good = factory.client("good").unwrap();
    assert!(good.has_informer(&kind));
    assert!(good.has_synced());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_has_synced_requires_every_member() {
    let factory = InMemoryClientFactory::new();
    factory.set_faults(
        "b",
        ClientFaults {
            hold_sync: true,
            ..Default::default()
        },
    );
    let (manager, _source, factory) =
        fleet(vec![cluster("a"), cluster("b"), cluster("c")], factory);

    assert!(manager.has_synced());
    assert!(manager.status().is_empty());

    manager.fetch_client_info_once().await.unwrap();
    wait_until("members to connect", || manager.status().connected == 3).await;
    manager.trigger_sync(pods()).await.unwrap();

    let status = manager.status();
    assert_eq!((status.total, status.synced), (3, 2));
    assert!(!manager.has_synced());

    factory.client("b").unwrap().release_sync();
    assert!(manager.has_synced());
    assert!(manager.status().is_ready());

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_runs_until_cancelled_then_stops_members() {
    let (manager, source, factory) =
        fleet(vec![cluster("a"), cluster("b")], InMemoryClientFactory::new());
    let observer = Arc::new(Observer::default());
    manager.add_cluster_event_handler(observer.clone()).await;
    let mut events = manager.subscribe();

    let token = CancellationToken::new();
    let runner = manager.clone();
    let run_token = token.clone();
    let handle = tokio::spawn(async move { runner.start(run_token).await });

    wait_until("fleet to connect", || manager.status().connected == 2).await;
    assert!(matches!(
        manager.start(CancellationToken::new()).await,
        Err(ConvoyError::AlreadyRunning)
    ));

    source.upsert(cluster("c"));
    manager.trigger_reconcile();
    wait_until("reconcile to admit c", || manager.cluster_count() == 3).await;

    token.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(manager.cluster_count(), 0);
    assert!(!manager.is_running());
    for name in ["a", "b", "c"] {
        assert_eq!(factory.client(name).unwrap().stop_count(), 1);
    }
    let mut deleted = observer.deleted.lock().clone();
    deleted.sort();
    assert_eq!(deleted, vec!["a", "b", "c"]);
    assert_eq!(observer.added.lock().len(), 3);

    let first = events.recv().await.unwrap();
    assert_eq!(first.change_type, ClusterChangeType::Added);

    // Stopping again is a no-op
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_start_is_evicted_and_readmitted() {
    let factory = InMemoryClientFactory::new();
    factory.set_faults(
        "flaky",
        ClientFaults {
            fail_start: Some("connection refused".to_string()),
            ..Default::default()
        },
    );
    let (manager, _source, factory) = fleet(vec![cluster("flaky")], factory);
    let observer = Arc::new(Observer::default());
    manager.add_cluster_event_handler(observer.clone()).await;

    manager.fetch_client_info_once().await.unwrap();
    wait_until("failed cluster to be evicted", || {
        !manager.registry().contains("flaky")
    })
    .await;
    wait_until("delete notification", || observer.deleted.lock().len() == 1).await;
    assert_eq!(*observer.added.lock(), vec!["flaky"]);

    factory.set_faults("flaky", ClientFaults::default());
    manager.fetch_client_info_once().await.unwrap();
    wait_until("flaky to connect", || {
        manager.get_connected_with_name("flaky").is_ok()
    })
    .await;
    assert_eq!(factory.build_count(), 2);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_removed_source_entry_is_evicted() {
    let (manager, source, factory) =
        fleet(vec![cluster("a"), cluster("b")], InMemoryClientFactory::new());
    manager.fetch_client_info_once().await.unwrap();

    source.remove("a");
    manager.fetch_client_info_once().await.unwrap();

    assert_eq!(manager.registry().names(), vec!["b"]);
    assert_eq!(factory.client("a").unwrap().stop_count(), 1);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_registration_during_admission_reaches_every_member() {
    let names = ["a", "b", "c", "d"];
    let (manager, _source, factory) = fleet(
        names.iter().map(|n| cluster(n)).collect(),
        InMemoryClientFactory::new(),
    );
    manager
        .register_before_start_hook(Arc::new(FnHook::new(
            |_token: CancellationToken, _client: Arc<dyn ClusterClient>| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<(), anyhow::Error>(())
            },
        )))
        .await;

    let handler: Arc<dyn ResourceEventHandler> =
        Arc::new(|_cluster: &str, _event: &ResourceEvent| {});
    let (reconciled, registered) = tokio::join!(manager.fetch_client_info_once(), async {
        // Lands while the pass is between admissions
        tokio::time::sleep(Duration::from_millis(45)).await;
        manager.add_resource_event_handler(pods(), handler).await
    });
    reconciled.unwrap();
    registered.unwrap();

    for name in names {
        assert_eq!(
            factory.client(name).unwrap().handler_count(&pods()),
            1,
            "cluster {}",
            name
        );
    }
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_cluster_file_keeps_fleet() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clusters.yaml");
    std::fs::write(
        &path,
        "- name: east\n  endpoint: memory://east\n- name: west\n  endpoint: memory://west\n",
    )
    .unwrap();

    let manager = MultiClusterManager::with_config(
        Arc::new(FileClusterSource::new(path.to_str().unwrap())),
        Arc::new(InMemoryClientFactory::new()),
        MultiClusterManagerConfig {
            stop_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );
    manager.fetch_client_info_once().await.unwrap();
    assert_eq!(manager.registry().names(), vec!["east", "west"]);

    std::fs::remove_file(&path).unwrap();
    let err = manager.fetch_client_info_once().await.unwrap_err();
    assert!(matches!(err, ConvoyError::Source(_)));
    assert_eq!(manager.registry().names(), vec!["east", "west"]);

    manager.stop().await.unwrap();
}
