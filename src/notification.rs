use serde::{Deserialize, Serialize};

/// A push notification handed to the session by the platform's push transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification body, if any.
    pub message: Option<String>,
    /// Whether the application was launched by the user opening this notification.
    pub was_launched_by: bool,
}

/// Receives push notifications.
pub trait NotificationListener {
    /// Called once per received notification.
    fn on_notification(&self, notification: &Notification);
}

pub(crate) struct NoopNotificationListener;
impl NotificationListener for NoopNotificationListener {
    fn on_notification(&self, _notification: &Notification) {}
}

impl<T: Fn(&Notification)> NotificationListener for T {
    fn on_notification(&self, notification: &Notification) {
        self(notification);
    }
}
