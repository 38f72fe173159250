// Cluster source implementations for fleet membership discovery
// Provides different strategies for fetching the desired set of clusters

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use convoy_common::{ConvoyError, Result};

use crate::model::{ClusterCfgInfo, Configuration};

/// Source of truth for which clusters should be in the fleet
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Fetch the desired cluster configurations
    async fn fetch(&self) -> Result<Vec<ClusterCfgInfo>>;

    fn source_type(&self) -> SourceType;
}

/// Source type enumeration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SourceType {
    /// Clusters held in memory or declared in configuration
    #[default]
    Static,
    /// YAML or JSON cluster list on disk
    File,
    /// Address server returning a JSON cluster list
    Http,
}

impl From<&str> for SourceType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "file" => SourceType::File,
            "http" | "address-server" | "addressserver" => SourceType::Http,
            _ => SourceType::Static,
        }
    }
}

/// Drop invalid and duplicate entries, keeping the first occurrence of a name
fn sanitize(clusters: Vec<ClusterCfgInfo>) -> Vec<ClusterCfgInfo> {
    let mut seen = HashSet::new();
    clusters
        .into_iter()
        .filter(|c| match c.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("Ignoring invalid cluster definition: {}", e);
                false
            }
        })
        .filter(|c| {
            let fresh = seen.insert(c.name.clone());
            if !fresh {
                warn!(cluster = %c.name, "Ignoring duplicate cluster definition");
            }
            fresh
        })
        .collect()
}

/// In-memory cluster source
///
/// Seeded from configuration or code and mutable at runtime, which makes it
/// the source of choice for embedding and tests.
#[derive(Default)]
pub struct StaticClusterSource {
    clusters: RwLock<Vec<ClusterCfgInfo>>,
    fail: RwLock<Option<String>>,
}

impl StaticClusterSource {
    pub fn new(clusters: Vec<ClusterCfgInfo>) -> Self {
        Self {
            clusters: RwLock::new(clusters),
            fail: RwLock::new(None),
        }
    }

    pub fn from_configuration(config: &Configuration) -> Self {
        Self::new(config.static_clusters())
    }

    /// Replace the whole desired set
    pub fn set(&self, clusters: Vec<ClusterCfgInfo>) {
        *self.clusters.write() = clusters;
    }

    /// Add or replace one cluster by name
    pub fn upsert(&self, cluster: ClusterCfgInfo) {
        let mut clusters = self.clusters.write();
        match clusters.iter_mut().find(|c| c.name == cluster.name) {
            Some(existing) => *existing = cluster,
            None => clusters.push(cluster),
        }
    }

    pub fn remove(&self, name: &str) {
        self.clusters.write().retain(|c| c.name != name);
    }

    /// Make subsequent fetches fail with `reason`, or succeed again with `None`
    pub fn set_failure(&self, reason: Option<String>) {
        *self.fail.write() = reason;
    }
}

#[async_trait]
impl ClusterSource for StaticClusterSource {
    async fn fetch(&self) -> Result<Vec<ClusterCfgInfo>> {
        if let Some(reason) = self.fail.read().clone() {
            return Err(ConvoyError::Source(reason));
        }
        Ok(sanitize(self.clusters.read().clone()))
    }

    fn source_type(&self) -> SourceType {
        SourceType::Static
    }
}

/// File-based cluster source
/// Reads a YAML (or JSON) list of cluster definitions, re-read on every fetch
pub struct FileClusterSource {
    path: String,
}

impl FileClusterSource {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }

    fn parse(content: &str) -> Result<Vec<ClusterCfgInfo>> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        // YAML is a superset of JSON, so one parser covers both formats
        serde_yaml::from_str(content).map_err(|e| ConvoyError::Source(e.to_string()))
    }
}

#[async_trait]
impl ClusterSource for FileClusterSource {
    async fn fetch(&self) -> Result<Vec<ClusterCfgInfo>> {
        // A missing file is a fetch failure, never an empty fleet
        if !Path::new(&self.path).exists() {
            warn!("Cluster definition file not found: {}", self.path);
            return Err(ConvoyError::Source(format!(
                "cluster definition file not found: {}",
                self.path
            )));
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConvoyError::Source(format!("failed to read {}: {}", self.path, e)))?;
        let clusters = sanitize(Self::parse(&content)?);
        debug!("Loaded {} cluster definitions from {}", clusters.len(), self.path);
        Ok(clusters)
    }

    fn source_type(&self) -> SourceType {
        SourceType::File
    }
}

/// Address server based cluster source
/// Fetches a JSON list of cluster definitions from a remote endpoint
pub struct HttpClusterSource {
    url: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpClusterSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConvoyError::Source(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            url: url.to_string(),
            client,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    async fn fetch_once(&self) -> Result<Vec<ClusterCfgInfo>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ConvoyError::Source(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConvoyError::Source(format!(
                "address server returned status: {}",
                response.status()
            )));
        }

        response
            .json::<Vec<ClusterCfgInfo>>()
            .await
            .map_err(|e| ConvoyError::Source(format!("invalid cluster list: {}", e)))
    }
}

#[async_trait]
impl ClusterSource for HttpClusterSource {
    async fn fetch(&self) -> Result<Vec<ClusterCfgInfo>> {
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            match self.fetch_once().await {
                Ok(clusters) => return Ok(sanitize(clusters)),
                Err(e) => {
                    warn!(
                        "Failed to fetch clusters from {} (attempt {}/{}): {}",
                        self.url,
                        attempt + 1,
                        self.max_retries,
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ConvoyError::Source("no attempts made".to_string())))
    }

    fn source_type(&self) -> SourceType {
        SourceType::Http
    }
}

/// Create a cluster source based on configuration
pub fn create_cluster_source(config: &Configuration) -> Result<Arc<dyn ClusterSource>> {
    match SourceType::from(config.source_type().as_str()) {
        SourceType::File => {
            info!("Using file based cluster source: {}", config.source_path());
            Ok(Arc::new(FileClusterSource::new(&config.source_path())))
        }
        SourceType::Http => {
            let url = config.source_url().ok_or_else(|| {
                ConvoyError::Config("convoy.cluster.source.url is required".to_string())
            })?;
            info!("Using address server based cluster source: {}", url);
            Ok(Arc::new(HttpClusterSource::new(
                &url,
                Duration::from_millis(config.source_timeout_ms()),
            )?))
        }
        SourceType::Static => {
            info!("Using static cluster source");
            Ok(Arc::new(StaticClusterSource::from_configuration(config)))
        }
    }
}
