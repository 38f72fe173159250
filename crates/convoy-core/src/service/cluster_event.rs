// Cluster change event handling
// Notifies observers and broadcast subscribers when clusters join or leave the fleet

use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::client::ClusterClient;

/// Type of cluster change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterChangeType {
    /// A cluster was admitted and started
    Added,
    /// A cluster was evicted and stopped
    Deleted,
}

impl std::fmt::Display for ClusterChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterChangeType::Added => write!(f, "CLUSTER_ADDED"),
            ClusterChangeType::Deleted => write!(f, "CLUSTER_DELETED"),
        }
    }
}

/// Cluster change event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub change_type: ClusterChangeType,
    pub cluster: String,
    pub endpoint: String,
    /// Timestamp of the event in milliseconds
    pub timestamp: i64,
}

impl ClusterEvent {
    pub fn added(cluster: &str, endpoint: &str) -> Self {
        Self::new(ClusterChangeType::Added, cluster, endpoint)
    }

    pub fn deleted(cluster: &str, endpoint: &str) -> Self {
        Self::new(ClusterChangeType::Deleted, cluster, endpoint)
    }

    fn new(change_type: ClusterChangeType, cluster: &str, endpoint: &str) -> Self {
        Self {
            change_type,
            cluster: cluster.to_string(),
            endpoint: endpoint.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Observer of fleet membership
///
/// `token` is the cluster's membership token: it is cancelled when the
/// cluster is evicted, so work started in `on_add` can be bound to it.
#[async_trait]
pub trait ClusterEventHandler: Send + Sync {
    async fn on_add(&self, token: &CancellationToken, client: Arc<dyn ClusterClient>);

    async fn on_delete(&self, token: &CancellationToken, client: Arc<dyn ClusterClient>);
}

/// Cluster event publisher
/// Invokes observers in registration order and broadcasts to subscribers
pub struct ClusterEventPublisher {
    broadcast_tx: broadcast::Sender<ClusterEvent>,
    handlers: RwLock<Vec<Arc<dyn ClusterEventHandler>>>,
}

impl ClusterEventPublisher {
    pub fn new(queue_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(queue_size.max(1));
        Self {
            broadcast_tx,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub async fn register_handler(&self, handler: Arc<dyn ClusterEventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
        debug!("Registered cluster event handler, total: {}", handlers.len());
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Notify every observer, then broadcast
    ///
    /// A panicking observer is logged and skipped; the rest still run.
    pub async fn publish(
        &self,
        event: ClusterEvent,
        token: &CancellationToken,
        client: &Arc<dyn ClusterClient>,
    ) {
        info!(
            cluster = %event.cluster,
            "Publishing cluster event: {}",
            event.change_type
        );

        // Snapshot so observers may register further observers
        let handlers: Vec<Arc<dyn ClusterEventHandler>> = self.handlers.read().await.clone();
        for (index, handler) in handlers.iter().enumerate() {
            let call = match event.change_type {
                ClusterChangeType::Added => handler.on_add(token, client.clone()),
                ClusterChangeType::Deleted => handler.on_delete(token, client.clone()),
            };
            if AssertUnwindSafe(call).catch_unwind().await.is_err() {
                error!(
                    cluster = %event.cluster,
                    handler = index,
                    "Cluster event handler panicked on {}",
                    event.change_type
                );
            }
        }

        // No subscribers is fine
        let _ = self.broadcast_tx.send(event);
    }
}

/// A simple logging handler for debugging
pub struct LoggingClusterEventHandler;

#[async_trait]
impl ClusterEventHandler for LoggingClusterEventHandler {
    async fn on_add(&self, _token: &CancellationToken, client: Arc<dyn ClusterClient>) {
        info!(
            "[ClusterEvent] Cluster added: {} ({})",
            client.name(),
            client.cluster_cfg_info().endpoint
        );
    }

    async fn on_delete(&self, _token: &CancellationToken, client: Arc<dyn ClusterClient>) {
        info!("[ClusterEvent] Cluster deleted: {}", client.name());
    }
}
