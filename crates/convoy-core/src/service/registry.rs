// Cluster registry
// Name -> client map shared by every fleet component

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use convoy_common::{ConvoyError, Result};

use crate::model::{ClusterCfgInfo, DuplicatePolicy};

use super::client::ClusterClient;

/// One admitted cluster
pub struct ClusterEntry {
    name: String,
    client: Arc<dyn ClusterClient>,
    cfg_info: ClusterCfgInfo,
    token: CancellationToken,
    admitted_at: i64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterEntry {
    pub fn new(client: Arc<dyn ClusterClient>, token: CancellationToken) -> Self {
        let cfg_info = client.cluster_cfg_info();
        Self {
            name: client.name().to_string(),
            client,
            cfg_info,
            token,
            admitted_at: chrono::Utc::now().timestamp_millis(),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }

    pub fn cfg_info(&self) -> &ClusterCfgInfo {
        &self.cfg_info
    }

    /// Cancellation token scoped to this cluster's membership
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn admitted_at(&self) -> i64 {
        self.admitted_at
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}

impl std::fmt::Debug for ClusterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEntry")
            .field("name", &self.name)
            .field("endpoint", &self.cfg_info.endpoint)
            .field("connected", &self.client.is_connected())
            .field("admitted_at", &self.admitted_at)
            .finish()
    }
}

/// Concurrency-safe registry of admitted clusters
///
/// Writers take the map lock exclusively and readers share it. The lock only
/// guards the map itself: it is never held across a client call or an await,
/// and every read returns a copy taken under a single guard.
pub struct ClusterRegistry {
    entries: RwLock<HashMap<String, Arc<ClusterEntry>>>,
    policy: DuplicatePolicy,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

impl ClusterRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Insert `entry`, returning the entry it replaced
    ///
    /// The replaced entry is no longer reachable through the registry; the
    /// caller owns stopping it.
    pub fn add(&self, entry: Arc<ClusterEntry>) -> Result<Option<Arc<ClusterEntry>>> {
        let mut entries = self.entries.write();
        if self.policy == DuplicatePolicy::Reject && entries.contains_key(entry.name()) {
            return Err(ConvoyError::DuplicateCluster(entry.name().to_string()));
        }
        debug!(cluster = %entry.name(), "Registering cluster");
        Ok(entries.insert(entry.name().to_string(), entry))
    }

    pub fn remove(&self, name: &str) -> Result<Arc<ClusterEntry>> {
        self.entries
            .write()
            .remove(name)
            .ok_or_else(|| ConvoyError::NotFound(name.to_string()))
    }

    /// Remove `entry` only if it is still the registered admission for its name
    pub fn remove_if_same(&self, entry: &Arc<ClusterEntry>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(entry.name()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(entry.name());
                true
            }
            _ => false,
        }
    }

    pub fn get_entry(&self, name: &str) -> Result<Arc<ClusterEntry>> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConvoyError::NotFound(name.to_string()))
    }

    /// Client for `name` regardless of connectivity
    pub fn get_with_name(&self, name: &str) -> Result<Arc<dyn ClusterClient>> {
        self.get_entry(name).map(|e| e.client.clone())
    }

    /// Client for `name` only while it is connected
    pub fn get_connected_with_name(&self, name: &str) -> Result<Arc<dyn ClusterClient>> {
        let entry = self.get_entry(name)?;
        if entry.is_connected() {
            Ok(entry.client.clone())
        } else {
            Err(ConvoyError::NotConnected(name.to_string()))
        }
    }

    pub fn get_all(&self) -> Vec<Arc<dyn ClusterClient>> {
        self.entries
            .read()
            .values()
            .map(|e| e.client.clone())
            .collect()
    }

    pub fn get_all_connected(&self) -> Vec<Arc<dyn ClusterClient>> {
        self.entries()
            .into_iter()
            .filter(|e| e.is_connected())
            .map(|e| e.client.clone())
            .collect()
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<Arc<ClusterEntry>> {
        self.entries.read().values().cloned().collect()
    }

    /// Sorted snapshot of the registered names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<Arc<ClusterEntry>> {
        self.entries.write().drain().map(|(_, e)| e).collect()
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("policy", &self.policy)
            .field("clusters", &self.names())
            .finish()
    }
}
