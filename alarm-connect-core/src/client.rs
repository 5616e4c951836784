//! Panel Client Interface
//!
//! A panel client owns the wire protocol for one physical panel. The
//! lifecycle manager never looks inside it: it builds one through a
//! [`ClientFactory`], drives its connect sequence from a background task,
//! pushes configuration changes into it and asks it to stop. The command
//! router forwards the five service operations to it unchanged.
//!
//! ## Session Reporting
//!
//! The connect sequence receives a [`SessionReporter`]. The client calls
//! [`SessionReporter::session_established`] once it is talking to the panel,
//! which moves the connection to `Active`, and
//! [`SessionReporter::session_lost`] when the link drops.

use crate::config::ConfigMap;
use crate::connection::{ConnectionEvent, ConnectionId, LifecycleCell, LifecycleState, PanelId};
use crate::{LinkError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Protocol client for one panel
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// Panel number this client was built for
    fn panel_id(&self) -> PanelId;

    /// Run the connect sequence
    ///
    /// Runs for the life of the session and returns when the client gives up
    /// or is stopped. The background task is cancelled after
    /// [`PanelClient::stop_all`] so this need not return promptly.
    async fn connect(&self, reporter: SessionReporter) -> Result<()>;

    /// Apply a new merged configuration without restarting the session
    fn update_config(&self, config: &ConfigMap) -> Result<()>;

    /// Stop all panel activity and flush pending writes
    async fn stop_all(&self) -> Result<()>;

    /// Retrieve the panel event log
    async fn fetch_event_log(&self, request: &EventLogRequest) -> Result<()>;

    /// Drop and re-establish the panel session
    async fn reconnect(&self, request: &ReconnectRequest) -> Result<()>;

    /// Send an arm/disarm style command
    async fn send_panel_command(&self, request: &PanelCommandRequest) -> Result<()>;

    /// Set or clear a sensor bypass
    async fn set_sensor_bypass(&self, request: &SensorBypassRequest) -> Result<()>;

    /// Ask a camera sensor for a fresh image
    async fn request_sensor_image(&self, request: &SensorImageRequest) -> Result<()>;
}

/// Builds panel clients
///
/// Errors for which [`LinkError::is_recoverable`] is true are treated as the
/// panel not being reachable yet.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create_client(
        &self,
        panel_id: PanelId,
        config: &ConfigMap,
    ) -> Result<Arc<dyn PanelClient>>;
}

/// Handle given to a client so it can report its session state
#[derive(Debug, Clone)]
pub struct SessionReporter {
    id: ConnectionId,
    panel_id: PanelId,
    state: Arc<LifecycleCell>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl SessionReporter {
    pub(crate) fn new(
        id: ConnectionId,
        panel_id: PanelId,
        state: Arc<LifecycleCell>,
        event_tx: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            id,
            panel_id,
            state,
            event_tx,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn panel_id(&self) -> PanelId {
        self.panel_id
    }

    /// Report that the panel session is up
    ///
    /// Returns `false` when the report was ignored because the connection is
    /// already active or being torn down.
    pub fn session_established(&self) -> bool {
        match self.state.advance(LifecycleState::Active) {
            Ok(()) => {
                info!("Panel {} session active ({})", self.panel_id, self.id);
                let _ = self.event_tx.send(ConnectionEvent::SessionActive {
                    id: self.id.clone(),
                    panel_id: self.panel_id,
                });
                true
            }
            Err(current) => {
                debug!(
                    "Ignoring session report for {} in state {}",
                    self.id, current
                );
                if current == LifecycleState::Active {
                    let _ = self.event_tx.send(ConnectionEvent::SessionActive {
                        id: self.id.clone(),
                        panel_id: self.panel_id,
                    });
                }
                false
            }
        }
    }

    /// Report that the panel session dropped
    pub fn session_lost(&self, reason: Option<String>) {
        if self.is_stopping() {
            return;
        }
        warn!(
            "Panel {} session lost ({}): {}",
            self.panel_id,
            self.id,
            reason.as_deref().unwrap_or("no reason given")
        );
        let _ = self.event_tx.send(ConnectionEvent::SessionLost {
            id: self.id.clone(),
            panel_id: self.panel_id,
            reason,
        });
    }

    /// Teardown has started; the client should wind down
    pub fn is_stopping(&self) -> bool {
        self.state.get().is_stopping()
    }
}

/// Named panel commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PanelCommand {
    Disarm,
    ArmHome,
    ArmAway,
    ArmHomeInstant,
    ArmAwayInstant,
    Powerlink,
    Mute,
    Trigger,
    Fire,
    Emergency,
    Panic,
    ArmHomeBypass,
    ArmAwayBypass,
    ArmHomeInstantBypass,
    ArmAwayInstantBypass,
}

impl PanelCommand {
    pub const ALL: [PanelCommand; 15] = [
        PanelCommand::Disarm,
        PanelCommand::ArmHome,
        PanelCommand::ArmAway,
        PanelCommand::ArmHomeInstant,
        PanelCommand::ArmAwayInstant,
        PanelCommand::Powerlink,
        PanelCommand::Mute,
        PanelCommand::Trigger,
        PanelCommand::Fire,
        PanelCommand::Emergency,
        PanelCommand::Panic,
        PanelCommand::ArmHomeBypass,
        PanelCommand::ArmAwayBypass,
        PanelCommand::ArmHomeInstantBypass,
        PanelCommand::ArmAwayInstantBypass,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PanelCommand::Disarm => "Disarm",
            PanelCommand::ArmHome => "Arm Home",
            PanelCommand::ArmAway => "Arm Away",
            PanelCommand::ArmHomeInstant => "Arm Home Instant",
            PanelCommand::ArmAwayInstant => "Arm Away Instant",
            PanelCommand::Powerlink => "Powerlink",
            PanelCommand::Mute => "Mute",
            PanelCommand::Trigger => "Trigger",
            PanelCommand::Fire => "Fire",
            PanelCommand::Emergency => "Emergency",
            PanelCommand::Panic => "Panic",
            PanelCommand::ArmHomeBypass => "Arm Home Bypass",
            PanelCommand::ArmAwayBypass => "Arm Away Bypass",
            PanelCommand::ArmHomeInstantBypass => "Arm Home Instant Bypass",
            PanelCommand::ArmAwayInstantBypass => "Arm Away Instant Bypass",
        }
    }

    /// Whether the panel expects an access code with this command
    pub fn needs_code(&self) -> bool {
        !matches!(
            self,
            PanelCommand::Powerlink
                | PanelCommand::Trigger
                | PanelCommand::Fire
                | PanelCommand::Emergency
                | PanelCommand::Panic
        )
    }
}

impl fmt::Display for PanelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PanelCommand {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().replace('_', " ");
        Self::ALL
            .into_iter()
            .find(|command| command.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| LinkError::Configuration(format!("unknown panel command: {}", s)))
    }
}

impl TryFrom<String> for PanelCommand {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PanelCommand> for String {
    fn from(command: PanelCommand) -> Self {
        command.as_str().to_string()
    }
}

/// Parameters of an event log request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogRequest {
    /// Access code, when the panel requires one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Parameters of a reconnect request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectRequest {}

/// Parameters of a panel command request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelCommandRequest {
    pub command: PanelCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Parameters of a sensor bypass request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorBypassRequest {
    /// `true` to bypass, `false` to re-arm the sensor
    #[serde(default)]
    pub bypass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Parameters of a sensor image request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorImageRequest {}
