//! Connection Events
//!
//! Events emitted by the lifecycle manager as connections come and go.

use super::{ConnectionId, PanelId};

/// Connection event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was registered and its background task spawned
    Registered {
        /// Connection ID
        id: ConnectionId,
        /// Panel number
        panel_id: PanelId,
    },

    /// The client reported an established session with the panel
    SessionActive {
        /// Connection ID
        id: ConnectionId,
        /// Panel number
        panel_id: PanelId,
    },

    /// The client reported losing its session (it may re-establish it)
    SessionLost {
        /// Connection ID
        id: ConnectionId,
        /// Panel number
        panel_id: PanelId,
        /// Reason reported by the client
        reason: Option<String>,
    },

    /// New merged configuration was pushed to the client
    Reconfigured {
        /// Connection ID
        id: ConnectionId,
        /// Panel number
        panel_id: PanelId,
    },

    /// The background task ended without being cancelled
    TaskFinished {
        /// Connection ID
        id: ConnectionId,
        /// Error message when the connect sequence failed
        error: Option<String>,
    },

    /// The connection was torn down and removed from the registry
    Removed {
        /// Connection ID
        id: ConnectionId,
        /// Panel number, free for reuse from now on
        panel_id: PanelId,
    },
}

impl ConnectionEvent {
    /// Connection the event is about
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            ConnectionEvent::Registered { id, .. }
            | ConnectionEvent::SessionActive { id, .. }
            | ConnectionEvent::SessionLost { id, .. }
            | ConnectionEvent::Reconfigured { id, .. }
            | ConnectionEvent::TaskFinished { id, .. }
            | ConnectionEvent::Removed { id, .. } => id,
        }
    }
}
