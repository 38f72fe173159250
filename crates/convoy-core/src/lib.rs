//! Convoy Core - Multi-cluster aggregation
//!
//! This crate provides:
//! - Cluster registry and membership reconciliation
//! - Fleet-wide informer registration with replay onto joining clusters
//! - Aggregate sync and connectivity status
//! - In-memory and Kubernetes-backed single-cluster clients

pub mod model;
pub mod service;

// Re-export fleet management
pub mod fleet {
    pub use crate::service::cluster::{
        BeforeStartHook, FnHook, MultiClusterManager, MultiClusterManagerConfig,
    };
    pub use crate::service::status::FleetStatus;
}

// Re-export commonly used types
pub use model::{
    ClusterCfgInfo, Configuration, DuplicatePolicy, ListOptions, ObjectKey, Patch, Resource,
    ResourceEvent, ResourceKind,
};
pub use service::{ClusterClient, ClusterClientFactory, MultiClusterManager};

pub use convoy_common::{ConvoyError, FanOutError, Result};
