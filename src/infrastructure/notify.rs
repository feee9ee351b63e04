use crate::domain::ports::{Notification, NotificationSink};
use crate::error::Result;
use async_trait::async_trait;

/// Delivers notifications to the log. Stands in for the chat delivery layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            user = notification.user,
            kind = ?notification.kind,
            payload = %notification.payload,
            "notification"
        );
        Ok(())
    }
}
