//! Control Input
//!
//! The daemon reads one JSON request per line from stdin. A request is
//! either a service call:
//!
//! ```json
//! {"service": "panel_command", "entity_id": "alarm_control_panel.alarm_panel_0", "command": "Arm Away", "code": "1234"}
//! ```
//!
//! or a daemon action:
//!
//! ```json
//! {"action": "status"}
//! {"action": "reload"}
//! {"action": "reload", "entry_id": "0c3f6a52-..."}
//! {"action": "restart"}
//! ```
//!
//! Each request is answered with one JSON line on stdout.

use alarm_connect_core::{ConnectionId, ConnectionInfo, ServiceCall};
use serde::{Deserialize, Serialize};

/// Daemon actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Report all connections
    Status,
    /// Reload the entries file, or one connection when an entry id is given
    Reload,
    /// Tear down and recreate every connection
    Restart,
}

/// One line of control input
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ControlRequest {
    Action {
        action: ControlAction,
        #[serde(default)]
        entry_id: Option<ConnectionId>,
    },
    Service(ServiceCall),
}

impl ControlRequest {
    /// Parse a control line, blank lines carry no request
    pub fn parse(line: &str) -> serde_json::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(line).map(Some)
    }
}

/// Answer to a control request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Status { connections: Vec<ConnectionInfo> },
    Accepted { accepted: String },
    Done { done: String },
    Error { error: String },
}

impl ControlResponse {
    pub fn to_line(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!("{{\"error\":\"unserializable response: {}\"}}", e))
    }
}
