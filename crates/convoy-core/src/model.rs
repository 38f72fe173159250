// Core data models and structures
// Resource model shared by every single-cluster client, cluster configuration
// snapshots and the application configuration wrapper

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use convoy_common::{CONFIG_PREFIX, ConvoyError, Result};

/// Group/version/kind of a typed resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Kind from the core ("") API group
    pub fn core(version: &str, kind: &str) -> Self {
        Self::new("", version, kind)
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Namespace/name key of a resource inside one cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn cluster_scoped(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.to_string(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A typed resource as seen by the fleet
///
/// The body is opaque: `spec` and `status` are carried as JSON values and
/// interpreted only by the single-cluster client that stores them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: Value,
}

impl Resource {
    pub fn new(kind: ResourceKind, key: ObjectKey) -> Self {
        Self {
            kind,
            key,
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }
}

/// A change observed by an informer
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEvent {
    Added(Resource),
    Updated { old: Resource, new: Resource },
    Deleted(Resource),
}

impl ResourceEvent {
    /// The resource in its most recent known state
    pub fn resource(&self) -> &Resource {
        match self {
            ResourceEvent::Added(r) | ResourceEvent::Deleted(r) => r,
            ResourceEvent::Updated { new, .. } => new,
        }
    }
}

/// Patch strategies understood by the single-cluster clients
#[derive(Clone, Debug, PartialEq)]
pub enum Patch {
    /// RFC 7386 JSON merge patch applied to the whole resource document
    Merge(Value),
    /// Replace `spec` wholesale
    Spec(Value),
}

/// Options for list and delete-all-of calls
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    /// Every label must match exactly
    pub labels: BTreeMap<String, String>,
    /// Indexed field selector as `(field, value)`; requires a registered index
    pub field: Option<(String, String)>,
}

impl ListOptions {
    pub fn in_namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_field(mut self, field: &str, value: &str) -> Self {
        self.field = Some((field.to_string(), value.to_string()));
        self
    }

    /// Label and namespace match; the field selector is evaluated by the caller
    pub fn matches(&self, resource: &Resource) -> bool {
        if let Some(ns) = &self.namespace
            && resource.key.namespace.as_deref() != Some(ns.as_str())
        {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| resource.labels.get(k) == Some(v))
    }
}

/// Cluster configuration snapshot captured at admission
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCfgInfo {
    pub name: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default = "default_qps")]
    pub qps: f32,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_qps() -> f32 {
    50.0
}

fn default_burst() -> u32 {
    100
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl ClusterCfgInfo {
    pub fn new(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            token: None,
            ca_data: None,
            insecure_skip_tls_verify: false,
            namespace: None,
            qps: default_qps(),
            burst: default_burst(),
            timeout_ms: default_timeout_ms(),
            labels: BTreeMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reject snapshots that can never produce a working client
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConvoyError::Config("cluster name is empty".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConvoyError::Config(format!(
                "cluster '{}' has no endpoint",
                self.name
            )));
        }
        Ok(())
    }
}

/// Policy applied when a cluster name is admitted twice
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Stop the registered cluster, then admit the new one
    #[default]
    Replace,
    /// Fail the second admission with `DuplicateCluster`
    Reject,
}

impl From<&str> for DuplicatePolicy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "reject" => DuplicatePolicy::Reject,
            _ => DuplicatePolicy::Replace,
        }
    }
}

/// Application configuration backed by `config::Config`
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: config::Config,
}

impl Configuration {
    /// Create a new configuration from a Config instance
    pub fn from_config(config: config::Config) -> Self {
        Self { config }
    }

    /// Load `path` (any format `config` understands) with `CONVOY_*` environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(&CONFIG_PREFIX.to_uppercase()).separator("__"),
            )
            .build()
            .map_err(|e| ConvoyError::Config(e.to_string()))?;
        Ok(Self::from_config(config))
    }

    /// Interval between periodic reconciliation passes (default: 30000ms)
    pub fn reconcile_interval_ms(&self) -> u64 {
        self.get_u64("convoy.cluster.reconcile-interval-ms", 30_000)
    }

    /// Upper bound for one cluster's stop routine (default: 10000ms)
    pub fn stop_timeout_ms(&self) -> u64 {
        self.get_u64("convoy.cluster.stop-timeout-ms", 10_000)
    }

    /// Upper bound for one admission hook (default: 30000ms)
    pub fn hook_timeout_ms(&self) -> u64 {
        self.get_u64("convoy.cluster.hook-timeout-ms", 30_000)
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.config
            .get_string("convoy.cluster.duplicate-policy")
            .map(|s| DuplicatePolicy::from(s.as_str()))
            .unwrap_or_default()
    }

    /// Capacity of the cluster event broadcast channel (default: 1024)
    pub fn event_queue_size(&self) -> usize {
        match self.get_u64("convoy.cluster.event-queue-size", 1024) {
            0 => 1024,
            n => usize::try_from(n).unwrap_or(1024),
        }
    }

    /// Cluster source type: static, file or http (default: static)
    pub fn source_type(&self) -> String {
        self.config
            .get_string("convoy.cluster.source.type")
            .unwrap_or_else(|_| "static".to_string())
    }

    pub fn source_path(&self) -> String {
        self.config
            .get_string("convoy.cluster.source.path")
            .unwrap_or_else(|_| "conf/clusters.yaml".to_string())
    }

    pub fn source_url(&self) -> Option<String> {
        self.config.get_string("convoy.cluster.source.url").ok()
    }

    pub fn source_timeout_ms(&self) -> u64 {
        self.get_u64("convoy.cluster.source.timeout-ms", 5000)
    }

    /// Non-negative integer at `key`; negative or missing values fall back to `default`
    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Clusters declared inline under `convoy.cluster.source.clusters`
    pub fn static_clusters(&self) -> Vec<ClusterCfgInfo> {
        self.config
            .get::<Vec<ClusterCfgInfo>>("convoy.cluster.source.clusters")
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_display() {
        let pods = ResourceKind::core("v1", "Pod");
        assert_eq!(pods.api_version(), "v1");
        assert_eq!(pods.to_string(), "v1/Pod");

        let deploys = ResourceKind::new("apps", "v1", "Deployment");
        assert_eq!(deploys.to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn test_list_options_matching() {
        let kind = ResourceKind::core("v1", "ConfigMap");
        let res = Resource::new(kind, ObjectKey::namespaced("default", "settings"))
            .with_label("app", "web");

        assert!(ListOptions::default().matches(&res));
        assert!(ListOptions::in_namespace("default").matches(&res));
        assert!(!ListOptions::in_namespace("kube-system").matches(&res));
        assert!(ListOptions::default().with_label("app", "web").matches(&res));
        assert!(!ListOptions::default().with_label("app", "db").matches(&res));
    }

    #[test]
    fn test_cluster_cfg_info_defaults_from_yaml() {
        let yaml = "name: east-1\nendpoint: https://10.0.0.1:6443\n";
        let info: ClusterCfgInfo = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(info, ClusterCfgInfo::new("east-1", "https://10.0.0.1:6443"));
        assert_eq!(info.timeout(), Duration::from_secs(30));
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_cluster_cfg_info_validation() {
        assert!(ClusterCfgInfo::new("", "https://a").validate().is_err());
        assert!(ClusterCfgInfo::new("a", " ").validate().is_err());
    }

    #[test]
    fn test_duplicate_policy_from_str() {
        assert_eq!(DuplicatePolicy::from("reject"), DuplicatePolicy::Reject);
        assert_eq!(DuplicatePolicy::from("REJECT"), DuplicatePolicy::Reject);
        assert_eq!(DuplicatePolicy::from("replace"), DuplicatePolicy::Replace);
        assert_eq!(DuplicatePolicy::from("other"), DuplicatePolicy::Replace);
    }

    #[test]
    fn test_configuration_defaults() {
        let config = Configuration::default();
        assert_eq!(config.reconcile_interval_ms(), 30_000);
        assert_eq!(config.duplicate_policy(), DuplicatePolicy::Replace);
        assert_eq!(config.source_type(), "static");
        assert!(config.static_clusters().is_empty());
    }

    #[test]
    fn test_configuration_overrides() {
        let config = config::Config::builder()
            .set_default("convoy.cluster.stop-timeout-ms", 250)
            .unwrap()
            .set_default("convoy.cluster.duplicate-policy", "reject")
            .unwrap()
            .build()
            .unwrap();
        let config = Configuration::from_config(config);
        assert_eq!(config.stop_timeout_ms(), 250);
        assert_eq!(config.duplicate_policy(), DuplicatePolicy::Reject);
    }

    #[test]
    fn test_configuration_negative_values_fall_back() {
        let config = config::Config::builder()
            .set_default("convoy.cluster.stop-timeout-ms", -5)
            .unwrap()
            .set_default("convoy.cluster.event-queue-size", -1)
            .unwrap()
            .set_default("convoy.cluster.hook-timeout-ms", 0)
            .unwrap()
            .build()
            .unwrap();
        let config = Configuration::from_config(config);
        assert_eq!(config.stop_timeout_ms(), 10_000);
        assert_eq!(config.event_queue_size(), 1024);
        assert_eq!(config.hook_timeout_ms(), 0);
        assert_eq!(config.reconcile_interval_ms(), 30_000);
    }

    #[test]
    fn test_configuration_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convoy.yaml");
        std::fs::write(
            &path,
            "convoy:\n  cluster:\n    reconcile-interval-ms: 750\n    source:\n      type: file\n",
        )
        .unwrap();

        let config = Configuration::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.reconcile_interval_ms(), 750);
        assert_eq!(config.source_type(), "file");
    }
}
