//! Alarm Panel Connection Lifecycle
//!
//! Manages the lifecycle of independent connections to alarm panels inside
//! one host process. Every connection talks to exactly one panel, identified
//! by a small panel number, through a protocol client running in its own
//! background task.
//!
//! ## Features
//!
//! - **Connection Lifecycle**: create, reconfigure and tear down connections,
//!   at most one per panel number
//! - **Configuration**: merge stored configuration with user options and
//!   migrate stored configuration between schema versions
//! - **Command Routing**: deliver service calls to the connection that owns
//!   the addressed panel
//! - **Notifications**: report routing failures to the user
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!  config entry ─▶│   LifecycleManager   │──▶ ClientFactory
//!                 └──────────┬───────────┘
//!                            │ write
//!                 ┌──────────▼───────────┐
//!                 │  ConnectionRegistry  │  (SharedRegistry)
//!                 └──────────▲───────────┘
//!                            │ read
//!                 ┌──────────┴───────────┐
//!  service call ─▶│    CommandRouter     │──▶ PanelClient
//!                 └──────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use alarm_connect_core::{
//!     CommandRouter, ConnectionRegistry, EntityDirectory, LifecycleManager, LogNotifier,
//!     ManagerConfig,
//! };
//! use std::sync::Arc;
//!
//! let registry = ConnectionRegistry::shared();
//! let manager = LifecycleManager::new(registry.clone(), factory, ManagerConfig::default());
//! let router = CommandRouter::new(
//!     registry,
//!     Arc::new(EntityDirectory::new()),
//!     Arc::new(LogNotifier),
//! );
//!
//! manager.create("entry-1".into(), &data, &options).await?;
//! router.dispatch(&call).await;
//! ```

pub mod client;
pub mod config;
pub mod connection;
mod error;
pub mod migration;
pub mod notification;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use client::{
    ClientFactory, EventLogRequest, PanelClient, PanelCommand, PanelCommandRequest,
    ReconnectRequest, SensorBypassRequest, SensorImageRequest, SessionReporter,
};
pub use config::{combine, ConfigEntry, ConfigMap, EmulationMode};
pub use connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionInfo, ConnectionRegistry,
    LifecycleManager, LifecycleState, ManagerConfig, PanelId, SharedRegistry,
};
pub use error::{LinkError, Result};
pub use migration::{migrate, migrate_and_combine, Migration, Migrator};
pub use notification::{LogNotifier, Notification, Notifier};
pub use router::{CommandRouter, EntityDirectory, PanelResolver, ServiceCall, TargetDescriptor};

/// Configuration schema version written by this crate
pub const CURRENT_SCHEMA_VERSION: u32 = 2;
