//! Error handling for alarm panel connections
//!
//! This module provides a single error type for every lifecycle, routing and
//! migration operation. Errors coming from the standard library and from
//! `serde_json` convert automatically through `thiserror`.
//!
//! ## Error Categories
//!
//! ### Lifecycle Errors
//! Raised by the [`LifecycleManager`](crate::LifecycleManager):
//! - `DuplicatePanel`: the merged configuration names a panel that already
//!   has a registered connection
//! - `NotReady`: the panel could not be reached while building its client;
//!   retry the whole creation later
//! - `NotFound`: the connection id is not registered
//! - `PanelIdentityChangeUnsupported`: an update tried to move a live
//!   connection to another panel number
//!
//! ### Routing Errors
//! Raised by the [`CommandRouter`](crate::CommandRouter):
//! - `UnknownTarget`: the addressed entity does not resolve to a panel
//! - `PanelNotConnected`: the panel resolves but nothing is connected to it
//!
//! ### Migration Errors
//! - `MalformedLegacyConfig`: stored configuration lacks a key that a
//!   migration step needs
//!
//! ### Client Errors
//! Panel clients report transport and protocol failures through the
//! remaining variants (`Transport`, `Timeout`, `ConnectionRefused`, ...).
//! The router passes them through untouched.
//!
//! ## Logging Errors
//!
//! ```rust,ignore
//! use tracing::{error, warn};
//!
//! match manager.destroy(&id).await {
//!     Err(LinkError::NotFound(id)) => warn!("Connection {} already removed", id),
//!     Err(e) => error!("Failed to stop connection {}: {}", id, e),
//!     Ok(()) => {}
//! }
//! ```

use crate::connection::{ConnectionId, PanelId};
use thiserror::Error;

/// Result type for connection operations
///
/// # Examples
///
/// ```rust
/// use alarm_connect_core::Result;
///
/// fn example() -> Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur while managing panel connections
///
/// # Examples
///
/// ```rust
/// use alarm_connect_core::{LinkError, PanelId};
///
/// let error = LinkError::DuplicatePanel(PanelId(3));
/// assert_eq!(error.to_string(), "Panel 3 is already configured");
///
/// let error = LinkError::PanelNotConnected(PanelId(5));
/// assert_eq!(error.to_string(), "Panel 5 is not connected");
/// ```
#[derive(Error, Debug)]
pub enum LinkError {
    /// I/O error (sockets, serial devices, files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A connection for this panel number is already registered
    #[error("Panel {0} is already configured")]
    DuplicatePanel(PanelId),

    /// A connection with this id is already registered
    #[error("Connection {0} is already registered")]
    DuplicateId(ConnectionId),

    /// The panel could not be reached while creating its client
    ///
    /// Nothing was registered; the whole creation may be retried.
    #[error("Panel not ready: {0}")]
    NotReady(String),

    /// No connection is registered under this id
    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    /// The target descriptor does not resolve to any panel
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// The target resolves to a panel that has no registered connection
    #[error("Panel {0} is not connected")]
    PanelNotConnected(PanelId),

    /// Stored configuration cannot be migrated
    #[error("Malformed legacy configuration: {0}")]
    MalformedLegacyConfig(String),

    /// An update tried to change the panel number of a live connection
    #[error("Changing panel number from {current} to {requested} is not supported")]
    PanelIdentityChangeUnsupported {
        /// Panel number the connection was created with
        current: PanelId,
        /// Panel number found in the updated configuration
        requested: PanelId,
    },

    /// Transport layer error (TCP, serial)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation timed out
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection attempt actively refused by the panel or its adapter
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Configuration is invalid or incomplete
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation attempted in an invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Feature not supported by this client
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl LinkError {
    /// Convert an I/O error into a more specific transport error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use alarm_connect_core::LinkError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "no answer");
    /// let error = LinkError::from_io_error(io_error, "connecting to panel");
    ///
    /// assert!(matches!(error, LinkError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => LinkError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                LinkError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable => {
                LinkError::Transport(format!("{}: {}", context, error))
            }
            _ => LinkError::Io(error),
        }
    }

    /// Check if this error is transient and the operation can be retried
    ///
    /// Client construction failures that are recoverable are reported by the
    /// lifecycle manager as [`LinkError::NotReady`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use alarm_connect_core::LinkError;
    ///
    /// assert!(LinkError::Timeout("panel".to_string()).is_recoverable());
    /// assert!(!LinkError::Configuration("no host".to_string()).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::Io(_)
                | LinkError::NotReady(_)
                | LinkError::Transport(_)
                | LinkError::Timeout(_)
                | LinkError::ConnectionRefused(_)
        )
    }

    /// Check if this error cannot be resolved without the user
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            LinkError::DuplicatePanel(_)
                | LinkError::MalformedLegacyConfig(_)
                | LinkError::PanelIdentityChangeUnsupported { .. }
                | LinkError::Configuration(_)
                | LinkError::UnknownTarget(_)
                | LinkError::PanelNotConnected(_)
        )
    }

    /// Get a user-friendly message suitable for a notification
    ///
    /// # Examples
    ///
    /// ```rust
    /// use alarm_connect_core::{LinkError, PanelId};
    ///
    /// let error = LinkError::DuplicatePanel(PanelId(1));
    /// assert!(error.user_message().contains("Panel Number 1 is not unique"));
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            LinkError::DuplicatePanel(panel) => format!(
                "The Panel Number {} is not unique, you already have a panel with this number.",
                panel
            ),
            LinkError::DuplicateId(id) => {
                format!("Connection {} is already running.", id)
            }
            LinkError::NotReady(msg) => {
                format!("Panel could not be reached: {}. Retrying later.", msg)
            }
            LinkError::NotFound(id) => format!("Connection {} is not running.", id),
            LinkError::UnknownTarget(_) => "Panel not found.".to_string(),
            LinkError::PanelNotConnected(panel) => format!("Panel {} not found.", panel),
            LinkError::MalformedLegacyConfig(msg) => format!(
                "Stored panel configuration could not be upgraded: {}. Please reconfigure the panel.",
                msg
            ),
            LinkError::PanelIdentityChangeUnsupported { current, requested } => format!(
                "The panel number cannot be changed from {} to {} while connected. Remove and re-add the panel.",
                current, requested
            ),
            LinkError::Transport(msg) => {
                format!("Transport error: {}. Check the panel connection.", msg)
            }
            LinkError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            LinkError::ConnectionRefused(_) => {
                "Connection refused. Check the panel's network adapter.".to_string()
            }
            LinkError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            LinkError::InvalidState(msg) => format!("Invalid state: {}.", msg),
            LinkError::UnsupportedFeature(msg) => format!("Feature not available: {}.", msg),
            LinkError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            LinkError::Io(e) => format!("I/O error: {}.", e),
            LinkError::Json(e) => format!("Data format error: {}.", e),
        }
    }
}
