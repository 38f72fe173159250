//! Error types and error codes for Convoy
//!
//! This module defines:
//! - `ConvoyError`: the error enum shared by every fleet component
//! - `FanOutError`: per-cluster failures collected by a fan-out call
//! - `ErrorCode`: structured error codes for callers that report errors remotely

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum ConvoyError {
    #[error("cluster '{0}' not found")]
    NotFound(String),

    #[error("cluster '{0}' is not connected")]
    NotConnected(String),

    #[error("cluster '{0}' already exists")]
    DuplicateCluster(String),

    #[error("admission hook #{hook} rejected cluster '{cluster}': {source}")]
    AdmissionHook {
        cluster: String,
        hook: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    FanOut(#[from] FanOutError),

    #[error("failed to start cluster '{cluster}': {reason}")]
    Start { cluster: String, reason: String },

    #[error("failed to stop cluster '{cluster}': {reason}")]
    Stop { cluster: String, reason: String },

    #[error("fleet is already running")]
    AlreadyRunning,

    #[error("cluster source error: {0}")]
    Source(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cluster '{cluster}' request failed: {message}")]
    Client { cluster: String, message: String },

    #[error("resource '{key}' not found in cluster '{cluster}'")]
    ResourceNotFound { cluster: String, key: String },

    #[error("resource '{key}' conflicts in cluster '{cluster}'")]
    Conflict { cluster: String, key: String },
}

impl ConvoyError {
    /// True when the named cluster is absent from the registry
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConvoyError::NotFound(_))
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, ConvoyError::NotConnected(_))
    }

    pub fn is_admission_hook(&self) -> bool {
        matches!(self, ConvoyError::AdmissionHook { .. })
    }

    /// Map the error onto its structured code
    pub fn error_code(&self) -> ErrorCode<'static> {
        match self {
            ConvoyError::NotFound(_) => CLUSTER_NOT_FOUND,
            ConvoyError::NotConnected(_) => CLUSTER_NOT_CONNECTED,
            ConvoyError::DuplicateCluster(_) => CLUSTER_DUPLICATE,
            ConvoyError::AdmissionHook { .. } => ADMISSION_REJECTED,
            ConvoyError::FanOut(_) => FAN_OUT_PARTIAL_FAILURE,
            ConvoyError::Start { .. } | ConvoyError::AlreadyRunning => LIFECYCLE_START_ERROR,
            ConvoyError::Stop { .. } => LIFECYCLE_STOP_ERROR,
            ConvoyError::Source(_) => CLUSTER_SOURCE_ERROR,
            ConvoyError::Config(_) => CONFIG_ERROR,
            ConvoyError::Client { .. } => CLIENT_ERROR,
            ConvoyError::ResourceNotFound { .. } => RESOURCE_NOT_FOUND,
            ConvoyError::Conflict { .. } => RESOURCE_CONFLICT,
        }
    }
}

/// Failures collected from one fan-out call
///
/// Successful applications are never rolled back, so the failures only name
/// the clusters that still need attention.
#[derive(Debug, Default)]
pub struct FanOutError {
    pub operation: String,
    pub failures: Vec<(String, ConvoyError)>,
}

impl FanOutError {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, cluster: impl Into<String>, error: ConvoyError) {
        self.failures.push((cluster.into(), error));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Names of the failing clusters, in the order they failed
    pub fn cluster_names(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Ok when nothing failed, otherwise the collected failures as an error
    pub fn into_result(self) -> Result<(), ConvoyError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ConvoyError::FanOut(self))
        }
    }
}

impl Display for FanOutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed on {} cluster(s)",
            self.operation,
            self.failures.len()
        )?;
        for (cluster, error) in &self.failures {
            write!(f, "; {}: {}", cluster, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for FanOutError {}

/// Error code structure for reporting
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 0,
    message: "success",
};

// Registry errors
pub const CLUSTER_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 30001,
    message: "cluster not found",
};

pub const CLUSTER_NOT_CONNECTED: ErrorCode<'static> = ErrorCode {
    code: 30002,
    message: "cluster not connected",
};

pub const CLUSTER_DUPLICATE: ErrorCode<'static> = ErrorCode {
    code: 30003,
    message: "cluster already exists",
};

// Membership and lifecycle errors
pub const ADMISSION_REJECTED: ErrorCode<'static> = ErrorCode {
    code: 30101,
    message: "cluster admission rejected",
};

pub const LIFECYCLE_START_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30102,
    message: "cluster start error",
};

pub const LIFECYCLE_STOP_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30103,
    message: "cluster stop error",
};

pub const CLUSTER_SOURCE_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30104,
    message: "cluster source error",
};

pub const FAN_OUT_PARTIAL_FAILURE: ErrorCode<'static> = ErrorCode {
    code: 30201,
    message: "fan-out failed on some clusters",
};

pub const CONFIG_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30301,
    message: "configuration error",
};

// Per-cluster request errors
pub const CLIENT_ERROR: ErrorCode<'static> = ErrorCode {
    code: 30401,
    message: "cluster request failed",
};

pub const RESOURCE_NOT_FOUND: ErrorCode<'static> = ErrorCode {
    code: 30402,
    message: "resource not found",
};

pub const RESOURCE_CONFLICT: ErrorCode<'static> = ErrorCode {
    code: 30403,
    message: "resource conflict",
};
