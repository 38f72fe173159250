// Fleet services: membership, fan-out, status and single-cluster clients

pub mod client;
pub mod cluster;
pub mod cluster_event;
pub mod cluster_source;
pub mod fanout;
#[cfg(feature = "kube")]
pub mod kube_client;
pub mod memory;
pub mod registry;
pub mod status;

// Re-export commonly used types
pub use client::{
    ClusterClient, ClusterClientFactory, FilteredHandler, IndexerFunc, Informers, Lifecycle,
    Predicate, ResourceEventHandler, ResourceOperate,
};
#[cfg(feature = "kube")]
pub use client::KubernetesResource;
pub use cluster::{BeforeStartHook, FnHook, MultiClusterManager, MultiClusterManagerConfig};
pub use cluster_event::{
    ClusterChangeType, ClusterEvent, ClusterEventHandler, ClusterEventPublisher,
    LoggingClusterEventHandler,
};
pub use cluster_source::{ClusterSource, SourceType, create_cluster_source};
pub use fanout::{FanOutCoordinator, Registration};
pub use registry::{ClusterEntry, ClusterRegistry};
pub use status::FleetStatus;
