//! Centralized Error Handling and User Notification
//!
//! Lifecycle failures are logged at the level they deserve and, when the
//! user has to do something about them, turned into a panel notification.

use alarm_connect_core::{ConnectionId, LinkError, Notification, Notifier};
use std::sync::Arc;
use tracing::{error, warn};

/// Central error handler for lifecycle operations
#[derive(Clone)]
pub struct ErrorHandler {
    notifier: Arc<dyn Notifier>,
}

impl ErrorHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Handle a lifecycle error with appropriate logging and user notification
    ///
    /// Returns whether the error is recoverable, for retry logic.
    pub fn handle_error(
        &self,
        error: &LinkError,
        context: &str,
        connection: Option<&ConnectionId>,
    ) -> bool {
        let connection = connection.map(ConnectionId::as_str).unwrap_or("-");

        if error.is_recoverable() {
            warn!("Recoverable error {} ({}): {}", context, connection, error);
        } else if error.requires_user_action() {
            warn!("User action required {} ({}): {}", context, connection, error);
        } else {
            error!("Error {} ({}): {}", context, connection, error);
        }

        if error.requires_user_action() {
            self.notifier
                .notify(Notification::panel(error.user_message()));
        }

        error.is_recoverable()
    }
}
