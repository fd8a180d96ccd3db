//! User notification side channel.
//!
//! Best-effort: delivering a notification never blocks a verdict and a
//! failed delivery is only logged.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Notification shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserNotification {
    /// A matching request was seen
    Request { app: String, host: String },
    /// A matching request could not be recorded
    Error { message: String },
}

impl UserNotification {
    pub fn title(&self) -> &str {
        match self {
            Self::Request { host, .. } => host,
            Self::Error { .. } => "Error Showing Request",
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Request { app, .. } => app,
            Self::Error { message } => message,
        }
    }

    /// Grouping key; request notifications are grouped per application
    pub fn thread_id(&self) -> Option<&str> {
        match self {
            Self::Request { app, .. } => Some(app),
            Self::Error { .. } => None,
        }
    }
}

/// Sink for user notifications
pub trait UserNotifier: Send + Sync {
    fn notify(&self, notification: UserNotification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl UserNotifier for LogNotifier {
    fn notify(&self, notification: UserNotification) {
        match &notification {
            UserNotification::Request { app, host } => info!("[{}] {}", app, host),
            UserNotification::Error { message } => warn!("{}: {}", notification.title(), message),
        }
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl UserNotifier for NullNotifier {
    fn notify(&self, _notification: UserNotification) {}
}

/// Forwards notifications to a bounded queue for another component to
/// deliver. When the queue is full the notification is dropped.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: Sender<UserNotification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its queue.
    pub fn new(capacity: usize) -> (Self, Receiver<UserNotification>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl UserNotifier for ChannelNotifier {
    fn notify(&self, notification: UserNotification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => debug!("Notification queue full, dropping {:?}", n),
            Err(TrySendError::Disconnected(_)) => debug!("Notification receiver gone"),
        }
    }
}
