//! Panel Connection Configuration
//!
//! Configuration for a panel connection lives in two untyped mappings: the
//! data stored when the connection was first configured (complete) and the
//! options changed later by the user (possibly partial). The two are merged
//! before being handed to a panel client, options winning per key.

use crate::connection::{ConnectionId, PanelId};
use crate::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Untyped configuration mapping
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Panel number key
pub const CONF_PANEL_NUMBER: &str = "panel_number";

/// Emulation mode key (schema version 2)
pub const CONF_EMULATION_MODE: &str = "emulation_mode";

/// Legacy boolean "force standard mode" key (schema version 1)
pub const CONF_FORCE_STANDARD: &str = "force_standard";

/// Device type key ("ethernet" or "usb")
pub const CONF_DEVICE_TYPE: &str = "device_type";

/// Panel adapter host key
pub const CONF_HOST: &str = "host";

/// Panel adapter port key
pub const CONF_PORT: &str = "port";

/// Combine base configuration with override configuration
///
/// Every key of `base` is copied, then every key of `overrides` is written
/// over it.
///
/// # Examples
///
/// ```rust
/// use alarm_connect_core::config::{combine, ConfigMap};
/// use serde_json::json;
///
/// let base: ConfigMap = serde_json::from_value(json!({"panel_number": 1, "host": "a"})).unwrap();
/// let overrides: ConfigMap = serde_json::from_value(json!({"host": "b"})).unwrap();
///
/// let merged = combine(&base, &overrides);
/// assert_eq!(merged["panel_number"], json!(1));
/// assert_eq!(merged["host"], json!("b"));
/// ```
pub fn combine(base: &ConfigMap, overrides: &ConfigMap) -> ConfigMap {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Extract the panel number from a merged configuration
///
/// Absent key means panel 0. Numbers and numeric strings are accepted.
pub fn panel_id_from(config: &ConfigMap) -> Result<PanelId> {
    let Some(value) = config.get(CONF_PANEL_NUMBER) else {
        return Ok(PanelId::default());
    };

    let number = match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        serde_json::Value::Null => return Ok(PanelId::default()),
        _ => None,
    };

    number
        .and_then(|n| u32::try_from(n).ok())
        .map(PanelId)
        .ok_or_else(|| {
            LinkError::Configuration(format!("invalid {}: {}", CONF_PANEL_NUMBER, value))
        })
}

/// How the connection presents itself to the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EmulationMode {
    /// Full Powerlink emulation (bidirectional, enrols as a Powerlink module)
    PowerlinkEmulation,
    /// Standard mode, no Powerlink enrolment
    Standard,
    /// Standard mode with minimal traffic towards the panel
    MinimalInteraction,
    /// Listen only, never send
    PassiveMonitor,
}

impl EmulationMode {
    /// All modes, in their documented order
    pub const ALL: [EmulationMode; 4] = [
        EmulationMode::PowerlinkEmulation,
        EmulationMode::Standard,
        EmulationMode::MinimalInteraction,
        EmulationMode::PassiveMonitor,
    ];

    /// Display label, as stored in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            EmulationMode::PowerlinkEmulation => "Powerlink Emulation",
            EmulationMode::Standard => "Standard",
            EmulationMode::MinimalInteraction => "Minimal Interaction",
            EmulationMode::PassiveMonitor => "Passive Monitor",
        }
    }

    /// Mode selected by the legacy `force_standard` flag
    pub fn from_force_standard(force_standard: bool) -> Self {
        if force_standard {
            Self::ALL[1]
        } else {
            Self::ALL[0]
        }
    }
}

impl fmt::Display for EmulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmulationMode {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LinkError::Configuration(format!("unknown emulation mode: {}", s)))
    }
}

impl TryFrom<String> for EmulationMode {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EmulationMode> for String {
    fn from(mode: EmulationMode) -> Self {
        mode.as_str().to_string()
    }
}

/// A persisted connection configuration as the host stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Host-assigned connection id
    pub entry_id: ConnectionId,

    /// Schema version of `data`
    #[serde(default = "default_version")]
    pub version: u32,

    /// Display title, refreshed to `Panel <n>` on setup
    #[serde(default)]
    pub title: String,

    /// Configuration captured when the entry was created
    #[serde(default)]
    pub data: ConfigMap,

    /// Options changed since creation
    #[serde(default)]
    pub options: ConfigMap,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    /// Create an entry at the current schema version
    pub fn new(entry_id: impl Into<ConnectionId>, data: ConfigMap) -> Self {
        Self {
            entry_id: entry_id.into(),
            version: crate::CURRENT_SCHEMA_VERSION,
            title: String::new(),
            data,
            options: ConfigMap::new(),
        }
    }

    /// Merged view of data and options
    pub fn combined(&self) -> ConfigMap {
        combine(&self.data, &self.options)
    }

    /// Title shown for a connected panel
    pub fn title_for(panel_id: PanelId) -> String {
        format!("Panel {}", panel_id)
    }
}
