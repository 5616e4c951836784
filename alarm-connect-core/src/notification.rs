//! User Notifications
//!
//! Service calls have no return channel, so failures that the user has to
//! see are delivered as notifications. The host decides how to show them.

use serde::{Deserialize, Serialize};
use tracing::info;

/// Notification id shared by all panel notifications, so a new one replaces
/// the previous one
pub const NOTIFICATION_ID: &str = "alarm_panel_notification";

/// Title of all panel notifications
pub const NOTIFICATION_TITLE: &str = "Alarm Panel";

/// A user-visible notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
}

impl Notification {
    /// Panel notification with the standard id and title
    pub fn panel(message: impl Into<String>) -> Self {
        Self {
            id: NOTIFICATION_ID.to_string(),
            title: NOTIFICATION_TITLE.to_string(),
            message: message.into(),
        }
    }
}

/// Delivers notifications to the user
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            notification_id = %notification.id,
            "{}: {}", notification.title, notification.message
        );
    }
}
