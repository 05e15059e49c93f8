//! Notification seam - fire-and-forget outward signals

use crate::error::NotifyError;
use ferry_types::{JobNotification, NotificationStatus};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

/// Outward signal for a job's status. Errors are logged by the caller and
/// never affect the transfer.
pub trait NotificationPort: Send + Sync {
    fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl NotificationPort for LogNotifier {
    fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        match &notification.status {
            NotificationStatus::Progress {
                bytes_copied,
                content_length,
                speed,
                ..
            } => info!(
                "[{}] {}: {} / {:?} bytes ({} B/s)",
                notification.notification_id, notification.file_name, bytes_copied, content_length, speed
            ),
            status => info!(
                "[{}] {}: {:?}",
                notification.notification_id, notification.file_name, status
            ),
        }
        Ok(())
    }
}

/// Forwards notifications into a channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<JobNotification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationPort for ChannelNotifier {
    fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        self.tx
            .send(notification.clone())
            .map_err(|_| NotifyError::Closed)
    }
}

/// Keeps notifications in memory
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    seen: Mutex<Vec<JobNotification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<JobNotification> {
        self.seen.lock().clone()
    }
}

impl NotificationPort for MemoryNotifier {
    fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        self.seen.lock().push(notification.clone());
        Ok(())
    }
}
