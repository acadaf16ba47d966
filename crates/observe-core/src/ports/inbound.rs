//! # Driving Ports (Inbound Callbacks)

use crate::domain::Notification;

/// Error returned by a notification handler. Logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives notifications for one registration.
///
/// Invoked synchronously from the delivery loop, one notification at a time
/// and in arrival order. Implementations must not block.
pub trait NotificationHandler: Send + Sync + 'static {
    /// Handle one fresh notification.
    fn on_notification(&self, notification: &Notification) -> Result<(), HandlerError>;
}

impl<F> NotificationHandler for F
where
    F: Fn(&Notification) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_notification(&self, notification: &Notification) -> Result<(), HandlerError> {
        self(notification)
    }
}
