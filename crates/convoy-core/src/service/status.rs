// Aggregate status reducer
// Folds per-cluster connectivity and sync flags into fleet-wide status

use std::sync::Arc;

use serde::Serialize;

use super::client::ClusterClient;

/// Logical AND of every client's sync flag; true when there are no clients
///
/// An empty fleet reports synced, so callers that need to tell "no clusters
/// yet" apart from "fully synced" must also look at the fleet size
/// (`FleetStatus::is_empty`).
pub fn has_synced(clients: &[Arc<dyn ClusterClient>]) -> bool {
    clients.iter().all(|c| c.has_synced())
}

/// Fleet status summary
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FleetStatus {
    pub total: usize,
    pub connected: usize,
    pub synced: usize,
}

impl FleetStatus {
    pub fn from_clients(clients: &[Arc<dyn ClusterClient>]) -> Self {
        let mut status = FleetStatus {
            total: clients.len(),
            ..Default::default()
        };
        for client in clients {
            if client.is_connected() {
                status.connected += 1;
            }
            if client.has_synced() {
                status.synced += 1;
            }
        }
        status
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn all_synced(&self) -> bool {
        self.synced == self.total
    }

    pub fn all_connected(&self) -> bool {
        self.connected == self.total
    }

    /// Synced with at least one member
    pub fn is_ready(&self) -> bool {
        !self.is_empty() && self.all_synced()
    }
}
