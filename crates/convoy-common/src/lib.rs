//! Convoy Common - Shared types for the Convoy fleet crates
//!
//! This crate provides the foundational types used across all Convoy components:
//! - Error types and error codes
//! - Common constants

pub mod error;

// Re-exports for convenience
pub use error::{ConvoyError, ErrorCode, FanOutError};

/// Result type used by every fleet operation
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Prefix of every configuration key read by Convoy
pub const CONFIG_PREFIX: &str = "convoy";

/// Fan-out operation names, used in aggregate errors and logs
pub const OP_ADD_RESOURCE_EVENT_HANDLER: &str = "add_resource_event_handler";
pub const OP_SET_INDEX_FIELD: &str = "set_index_field";
pub const OP_TRIGGER_SYNC: &str = "trigger_sync";
pub const OP_WATCH: &str = "watch";
pub const OP_RECONCILE: &str = "reconcile";
pub const OP_STOP: &str = "stop";
