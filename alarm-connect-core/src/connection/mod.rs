//! Panel Connections
//!
//! A connection is one configured panel: its client handle, the background
//! task that drives the client's connect sequence, and its lifecycle state.
//! Connections live in the [`ConnectionRegistry`] and are created and torn
//! down by the [`LifecycleManager`].

pub mod events;
pub mod manager;
pub mod registry;
pub mod state;

pub use events::ConnectionEvent;
pub use manager::{LifecycleManager, ManagerConfig};
pub use registry::{ConnectionRegistry, SharedRegistry};
pub use state::{LifecycleCell, LifecycleState};

use crate::client::PanelClient;
use crate::config::ConfigMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Host-assigned identifier of a configured connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Panel number, unique among registered connections
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PanelId(pub u32);

impl fmt::Display for PanelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owned handle to a connection's background task
///
/// Dropping the handle detaches the task; cancellation only happens through
/// [`TaskHandle::cancel`].
#[derive(Debug, Default)]
pub struct TaskHandle {
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Wrap a spawned task
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Abort the task
    ///
    /// Returns `false` when the task was already cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether the task has run to completion (or was never started)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// A registered panel connection
pub struct Connection {
    id: ConnectionId,
    panel_id: PanelId,
    client: Arc<dyn PanelClient>,
    task: TaskHandle,
    state: Arc<LifecycleCell>,
    base_config: ConfigMap,
    override_config: ConfigMap,
    config: ConfigMap,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("panel_id", &self.panel_id)
            .field("state", &self.state.get())
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Assemble a connection around an already built client
    pub(crate) fn new(
        id: ConnectionId,
        panel_id: PanelId,
        client: Arc<dyn PanelClient>,
        state: Arc<LifecycleCell>,
        base_config: ConfigMap,
        override_config: ConfigMap,
        config: ConfigMap,
    ) -> Self {
        Self {
            id,
            panel_id,
            client,
            task: TaskHandle::default(),
            state,
            base_config,
            override_config,
            config,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn panel_id(&self) -> PanelId {
        self.panel_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// Shared client handle
    pub fn client(&self) -> Arc<dyn PanelClient> {
        Arc::clone(&self.client)
    }

    /// Merged configuration currently applied to the client
    pub fn config(&self) -> &ConfigMap {
        &self.config
    }

    pub fn base_config(&self) -> &ConfigMap {
        &self.base_config
    }

    pub fn override_config(&self) -> &ConfigMap {
        &self.override_config
    }

    pub(crate) fn lifecycle(&self) -> &Arc<LifecycleCell> {
        &self.state
    }

    pub(crate) fn attach_task(&mut self, task: TaskHandle) {
        self.task = task;
    }

    pub(crate) fn cancel_task(&mut self) -> bool {
        let cancelled = self.task.cancel();
        if cancelled {
            debug!("Cancelled background task for connection {}", self.id);
        }
        cancelled
    }

    pub(crate) fn replace_config(&mut self, override_config: ConfigMap, config: ConfigMap) {
        self.override_config = override_config;
        self.config = config;
    }

    /// Point-in-time view for status reporting
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            panel_id: self.panel_id,
            state: self.state.get(),
            task_finished: self.task.is_finished(),
            created_at: self.created_at,
        }
    }
}

/// Snapshot of a registered connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub panel_id: PanelId,
    pub state: LifecycleState,
    /// The background task ended on its own (session gave up or failed)
    pub task_finished: bool,
    pub created_at: DateTime<Utc>,
}
