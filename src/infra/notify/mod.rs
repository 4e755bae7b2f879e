//! Notification sink that writes outcomes to the tracing log.

use tracing::{error, info};

use crate::domain::{NotificationLevel, NotificationSink};

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, level: NotificationLevel, message: &str) {
        match level {
            NotificationLevel::Info => info!(target: "notifications", "{}", message),
            NotificationLevel::Success => {
                info!(target: "notifications", success = true, "{}", message)
            }
            NotificationLevel::Error => error!(target: "notifications", "{}", message),
        }
    }
}
