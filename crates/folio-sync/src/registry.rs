//! # Connection Registry
//!
//! Process-wide table of live, authenticated connections.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 RwLock<RegistryInner>  (one lock)                       │
//! │                                                                         │
//! │  connections: ConnectionId → Arc<Connection>     (the full set)         │
//! │                                                                         │
//! │  by_user:     UserId → [ConnectionId, ...]       (arrival order)        │
//! │                                                                         │
//! │  A connection id is in by_user[u] iff it is in `connections` and its   │
//! │  identity belongs to u. Both maps change under the same write guard.   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers (`snapshot`, `len`) take the shared lock and copy out; nothing
//! holds the lock across network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use folio_core::UserId;

use crate::connection::{Connection, ConnectionId};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, Vec<ConnectionId>>,
}

/// Point-in-time registry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
}

/// Index of live authenticated connections, keyed by connection and by user.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Registers an authenticated connection.
    ///
    /// Re-adding a connection that is already present is a no-op.
    pub async fn add(&self, connection: Arc<Connection>) -> SyncResult<()> {
        let user_id = match connection.identity() {
            Some(identity) if connection.is_authenticated() => identity.user_id,
            _ => return Err(SyncError::NotAuthenticated(connection.id().to_string())),
        };

        let id = connection.id();
        let mut inner = self.inner.write().await;

        if inner.connections.insert(id, connection).is_none() {
            inner.by_user.entry(user_id).or_default().push(id);
        }

        debug!(
            conn_id = %id,
            user_id,
            devices = inner.by_user.get(&user_id).map_or(0, Vec::len),
            total = inner.connections.len(),
            "Connection registered"
        );

        Ok(())
    }

    /// Removes a connection from both indices.
    ///
    /// Returns the removed connection, or `None` if it was not registered.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;

        let connection = inner.connections.remove(&id)?;

        if let Some(user_id) = connection.user_id() {
            if let Some(devices) = inner.by_user.get_mut(&user_id) {
                devices.retain(|device| *device != id);
                if devices.is_empty() {
                    inner.by_user.remove(&user_id);
                }
            }
        }

        debug!(conn_id = %id, total = inner.connections.len(), "Connection unregistered");

        Some(connection)
    }

    /// Copies out the user's devices in registration order.
    pub async fn snapshot(&self, user_id: UserId) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;

        inner
            .by_user
            .get(&user_id)
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of registered devices for one user.
    pub async fn device_count(&self, user_id: UserId) -> usize {
        self.inner
            .read()
            .await
            .by_user
            .get(&user_id)
            .map_or(0, Vec::len)
    }

    /// Number of users with at least one registered device.
    pub async fn user_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().await.connections.contains_key(&id)
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            connections: inner.connections.len(),
            users: inner.by_user.len(),
        }
    }

    /// Removes and returns every connection (used on shutdown).
    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        inner.by_user.clear();
        inner.connections.drain().map(|(_, conn)| conn).collect()
    }
}
