//! Connection admission
//!
//! Caps the number of concurrent connections a single peer IP may hold open.
//! A connection that gets no slot is still allowed to finish the SSH
//! handshake, but every login attempt on it is refused immediately.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Configuration for connection tracking
#[derive(Debug, Clone)]
pub struct ConnectionTrackerConfig {
    /// Maximum concurrent connections per peer IP (0 = unlimited)
    pub max_connections_per_ip: usize,
}

impl Default for ConnectionTrackerConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 32,
        }
    }
}

/// Tracks live connections per peer IP
///
/// The lock is a plain mutex: slots are taken from the synchronous russh
/// `new_client` hook and released from `Drop`.
#[derive(Clone)]
pub struct ConnectionTracker {
    config: ConnectionTrackerConfig,
    connections: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker
    pub fn new(config: ConnectionTrackerConfig) -> Self {
        Self {
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim a slot for a new connection from `ip`
    ///
    /// # Returns
    ///
    /// A guard that frees the slot when dropped, or `None` when `ip` already
    /// holds the maximum number of connections.
    pub fn try_acquire(&self, ip: IpAddr) -> Option<ConnectionSlot> {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        let current = connections.entry(ip).or_insert(0);

        let max = self.config.max_connections_per_ip;
        if max != 0 && *current >= max {
            warn!(
                event = "connection_limit_reached",
                client_ip = %ip,
                current_connections = *current,
                max_connections = max,
                "Connection limit reached"
            );
            return None;
        }

        *current += 1;
        debug!(client_ip = %ip, connections = *current, "Connection admitted");

        Some(ConnectionSlot {
            ip,
            connections: self.connections.clone(),
        })
    }

    /// Current connection count for a peer IP
    pub fn connection_count(&self, ip: IpAddr) -> usize {
        let connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        connections.get(&ip).copied().unwrap_or(0)
    }

    /// Tuple of (distinct peer IPs, total connections)
    #[cfg(test)]
    fn stats(&self) -> (usize, usize) {
        let connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        (connections.len(), connections.values().sum())
    }
}

/// One admitted connection; frees its slot on drop
pub struct ConnectionSlot {
    ip: IpAddr,
    connections: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl ConnectionSlot {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = connections.get_mut(&self.ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&self.ip);
            }
        }
    }
}
