//! Connection Registry
//!
//! In-memory index of every registered connection, by connection id and by
//! panel number. The registry enforces that a panel number belongs to at most
//! one connection and keeps both indices in step: an entry is either present
//! under both keys or under neither.
//!
//! The registry itself does no locking. It is shared as a [`SharedRegistry`]
//! (`Arc<RwLock<_>>`) between the lifecycle manager, which mutates it, and the
//! command router, which only reads it.

use super::{Connection, ConnectionId, ConnectionInfo, PanelId};
use crate::{LinkError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry shared between the lifecycle manager and the command router
pub type SharedRegistry = Arc<RwLock<ConnectionRegistry>>;

/// Registered connections indexed by id and by panel number
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    panels: HashMap<PanelId, ConnectionId>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry ready to be shared
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Register a connection
    ///
    /// Fails with `DuplicateId` if the id is taken and with `DuplicatePanel`
    /// if the panel number is taken. Nothing changes on failure.
    pub fn register(&mut self, connection: Connection) -> Result<()> {
        let id = connection.id().clone();
        let panel_id = connection.panel_id();

        if self.connections.contains_key(&id) {
            return Err(LinkError::DuplicateId(id));
        }
        if self.panels.contains_key(&panel_id) {
            return Err(LinkError::DuplicatePanel(panel_id));
        }

        debug!("Registering connection {} for panel {}", id, panel_id);
        self.panels.insert(panel_id, id.clone());
        self.connections.insert(id, connection);
        Ok(())
    }

    /// Look up a connection by id
    pub fn lookup(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub(crate) fn lookup_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Look up the connection that owns a panel number
    pub fn lookup_by_panel(&self, panel_id: PanelId) -> Option<&Connection> {
        self.panels
            .get(&panel_id)
            .and_then(|id| self.connections.get(id))
    }

    /// Remove a connection, clearing both indices
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        self.panels.remove(&connection.panel_id());
        debug!(
            "Removed connection {} for panel {}",
            id,
            connection.panel_id()
        );
        Some(connection)
    }

    /// Whether a registered connection already owns this panel number
    pub fn is_panel_id_taken(&self, panel_id: PanelId) -> bool {
        self.panels.contains_key(&panel_id)
    }

    /// Whether a connection is registered under this id
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Get all registered connection ids
    pub fn ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.connections.keys()
    }

    /// Get all registered connections
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Snapshots of all registered connections, ordered by panel number
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> =
            self.connections.values().map(Connection::info).collect();
        infos.sort_by_key(|info| info.panel_id);
        infos
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
