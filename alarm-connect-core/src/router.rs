//! Command Router
//!
//! Routes service calls to the connection that owns the addressed panel.
//!
//! A call addresses an entity (`alarm_control_panel.house`), not a panel.
//! A [`PanelResolver`] turns the entity into a panel number, the registry
//! turns the panel number into a connection, and the call is forwarded to
//! that connection's client. The router adds two failure modes of its own,
//! `UnknownTarget` and `PanelNotConnected`, and reports both to the user as
//! notifications. Client results pass through untouched.

use crate::client::{
    EventLogRequest, PanelClient, PanelCommandRequest, ReconnectRequest, SensorBypassRequest,
    SensorImageRequest,
};
use crate::connection::{PanelId, SharedRegistry};
use crate::notification::{Notification, Notifier};
use crate::{LinkError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

static ENTITY_ID_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn entity_id_pattern() -> Option<&'static Regex> {
    ENTITY_ID_PATTERN
        .get_or_init(|| {
            Regex::new(r"^[0-9a-z]+(?:_[0-9a-z]+)*\.[0-9a-z]+(?:_[0-9a-z]+)*$").ok()
        })
        .as_ref()
}

/// Externally addressed target of a service call (an entity id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetDescriptor(String);

impl TargetDescriptor {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self(entity_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a well-formed `domain.object_id`
    pub fn is_valid_entity_id(&self) -> bool {
        entity_id_pattern().is_some_and(|pattern| pattern.is_match(&self.0))
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetDescriptor {
    fn from(entity_id: &str) -> Self {
        Self::new(entity_id)
    }
}

/// Resolves a target descriptor to the panel it belongs to
#[async_trait]
pub trait PanelResolver: Send + Sync {
    async fn resolve_panel_id(&self, target: &TargetDescriptor) -> Option<PanelId>;
}

/// Entity to panel directory maintained by the host
///
/// Malformed entity ids never resolve.
#[derive(Debug, Default)]
pub struct EntityDirectory {
    entities: RwLock<HashMap<TargetDescriptor, PanelId>>,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record which panel an entity belongs to
    pub async fn register(&self, entity: TargetDescriptor, panel_id: PanelId) {
        debug!("Entity {} belongs to panel {}", entity, panel_id);
        self.entities.write().await.insert(entity, panel_id);
    }

    pub async fn unregister(&self, entity: &TargetDescriptor) -> Option<PanelId> {
        self.entities.write().await.remove(entity)
    }

    /// Forget every entity of a panel
    pub async fn unregister_panel(&self, panel_id: PanelId) {
        self.entities
            .write()
            .await
            .retain(|_, owner| *owner != panel_id);
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

#[async_trait]
impl PanelResolver for EntityDirectory {
    async fn resolve_panel_id(&self, target: &TargetDescriptor) -> Option<PanelId> {
        if !target.is_valid_entity_id() {
            debug!("Invalid entity id {}", target);
            return None;
        }
        self.entities.read().await.get(target).copied()
    }
}

/// A service call addressed to one panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum ServiceCall {
    /// Retrieve the panel event log
    EventLog {
        entity_id: TargetDescriptor,
        #[serde(flatten)]
        request: EventLogRequest,
    },
    /// Force the panel session to reconnect
    Reconnect {
        entity_id: TargetDescriptor,
        #[serde(flatten)]
        request: ReconnectRequest,
    },
    /// Send a named panel command
    PanelCommand {
        entity_id: TargetDescriptor,
        #[serde(flatten)]
        request: PanelCommandRequest,
    },
    /// Set or clear a sensor bypass
    SensorBypass {
        entity_id: TargetDescriptor,
        #[serde(flatten)]
        request: SensorBypassRequest,
    },
    /// Refresh a sensor image
    SensorImage {
        entity_id: TargetDescriptor,
        #[serde(flatten)]
        request: SensorImageRequest,
    },
}

impl ServiceCall {
    /// Entity the call is addressed to
    pub fn target(&self) -> &TargetDescriptor {
        match self {
            ServiceCall::EventLog { entity_id, .. }
            | ServiceCall::Reconnect { entity_id, .. }
            | ServiceCall::PanelCommand { entity_id, .. }
            | ServiceCall::SensorBypass { entity_id, .. }
            | ServiceCall::SensorImage { entity_id, .. } => entity_id,
        }
    }

    /// Name used in logs and notifications
    pub fn label(&self) -> &'static str {
        match self {
            ServiceCall::EventLog { .. } => "Event log",
            ServiceCall::Reconnect { .. } => "Service Panel reconnect",
            ServiceCall::PanelCommand { .. } => "Service Panel command",
            ServiceCall::SensorBypass { .. } => "Service Panel sensor bypass",
            ServiceCall::SensorImage { .. } => "Service sensor image update",
        }
    }

    async fn forward(&self, client: &dyn PanelClient) -> Result<()> {
        match self {
            ServiceCall::EventLog { request, .. } => client.fetch_event_log(request).await,
            ServiceCall::Reconnect { request, .. } => client.reconnect(request).await,
            ServiceCall::PanelCommand { request, .. } => client.send_panel_command(request).await,
            ServiceCall::SensorBypass { request, .. } => client.set_sensor_bypass(request).await,
            ServiceCall::SensorImage { request, .. } => {
                client.request_sensor_image(request).await
            }
        }
    }
}

/// Routes service calls to the owning connection
pub struct CommandRouter {
    registry: SharedRegistry,
    resolver: Arc<dyn PanelResolver>,
    notifier: Arc<dyn Notifier>,
}

impl CommandRouter {
    pub fn new(
        registry: SharedRegistry,
        resolver: Arc<dyn PanelResolver>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            resolver,
            notifier,
        }
    }

    /// Route a call to its connection
    ///
    /// Routing failures are reported to the user and returned. Client
    /// results are returned as they are.
    pub async fn route(&self, call: &ServiceCall) -> Result<()> {
        let target = call.target();

        let Some(panel_id) = self.resolver.resolve_panel_id(target).await else {
            warn!("{}: {} does not resolve to a panel", call.label(), target);
            self.notify(format!("{} failed - Panel not found", call.label()));
            return Err(LinkError::UnknownTarget(target.to_string()));
        };

        // Release the registry before calling into the client
        let client = {
            let registry = self.registry.read().await;
            registry
                .lookup_by_panel(panel_id)
                .filter(|connection| !connection.state().is_stopping())
                .map(|connection| connection.client())
        };

        let Some(client) = client else {
            warn!("{}: panel {} is not connected", call.label(), panel_id);
            self.notify(format!(
                "{} failed - Panel {} not found",
                call.label(),
                panel_id
            ));
            return Err(LinkError::PanelNotConnected(panel_id));
        };

        debug!("{} routed to panel {}", call.label(), panel_id);
        call.forward(client.as_ref()).await
    }

    /// Fire-and-forget entry point for service calls
    ///
    /// Nothing is returned to the caller; every failure ends up as a
    /// notification.
    pub async fn dispatch(&self, call: &ServiceCall) {
        info!("{} called for {}", call.label(), call.target());

        match self.route(call).await {
            Ok(()) => {}
            Err(LinkError::UnknownTarget(_)) | Err(LinkError::PanelNotConnected(_)) => {}
            Err(e) => {
                warn!("{} failed: {}", call.label(), e);
                self.notify(format!("{} failed - {}", call.label(), e.user_message()));
            }
        }
    }

    fn notify(&self, message: String) {
        self.notifier.notify(Notification::panel(message));
    }
}
