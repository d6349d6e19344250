use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::connection::Role;
use crate::event::{ForwarderEvent, ForwarderStatus};
use crate::response::ErrorPage;

/// Point-in-time copy of the relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    /// Total number of accepted connections
    pub total_connections: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Bytes received from clients and forwarded (or drained)
    pub bytes_from_clients: u64,
    /// Bytes received from the backend and relayed to clients
    pub bytes_from_backend: u64,
    /// Bytes of oversized request bodies read and dropped
    pub discarded_bytes: u64,
    /// Error responses sent, keyed by status code
    pub rejected: BTreeMap<u16, u64>,
    /// Connections whose backend could not be reached
    pub backend_failures: u64,
    /// Timestamp when the tracker was created (Unix timestamp)
    pub start_time: u64,
}

impl RelayStatsSnapshot {
    /// Total error responses across all status codes
    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }
}

/// Process-wide statistics tracker, shared by all connection tasks
#[derive(Debug, Clone)]
pub struct RelayStats {
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    bytes_from_clients: Arc<AtomicU64>,
    bytes_from_backend: Arc<AtomicU64>,
    discarded_bytes: Arc<AtomicU64>,
    backend_failures: Arc<AtomicU64>,
    rejected: Arc<Mutex<BTreeMap<u16, u64>>>,
    start_time: u64,
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            bytes_from_clients: Arc::new(AtomicU64::new(0)),
            bytes_from_backend: Arc::new(AtomicU64::new(0)),
            discarded_bytes: Arc::new(AtomicU64::new(0)),
            backend_failures: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(Mutex::new(BTreeMap::new())),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Increment active connections (called when connection starts)
    pub fn connection_started(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections (called when connection ends)
    pub fn connection_ended(&self) {
        // Saturate so an unbalanced call can never wrap around
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Account a forwarder event
    pub fn record_event(&self, event: &ForwarderEvent) {
        match *event {
            ForwarderEvent::Transferred {
                from: Role::Client,
                bytes,
            } => {
                self.bytes_from_clients.fetch_add(bytes, Ordering::Relaxed);
            }
            ForwarderEvent::Transferred {
                from: Role::Server,
                bytes,
            } => {
                self.bytes_from_backend.fetch_add(bytes, Ordering::Relaxed);
            }
            ForwarderEvent::Status(ForwarderStatus::ServerUnavailable) => {
                self.backend_failures.fetch_add(1, Ordering::Relaxed);
            }
            ForwarderEvent::Status(_) => {}
        }
    }

    /// Account an error response sent to a client
    pub fn record_rejection(&self, page: ErrorPage) {
        *self.rejected.lock().entry(page.status()).or_insert(0) += 1;
    }

    /// Account drained bytes of an oversized body
    pub fn add_discarded(&self, bytes: u64) {
        self.discarded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_from_clients: self.bytes_from_clients.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
            rejected: self.rejected.lock().clone(),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}
