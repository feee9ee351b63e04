use crate::domain::UserId;
use crate::domain::ports::{Notification, NotificationKind, NotificationSinkRef};
use tracing::warn;

/// Notifications collected while a unit of work is open.
///
/// They are only delivered after the unit commits, and delivery failures are logged
/// rather than propagated.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<Notification>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, user: UserId, kind: NotificationKind, payload: serde_json::Value) {
        self.pending.push(Notification::new(user, kind, payload));
    }

    pub fn extend(&mut self, other: Outbox) {
        self.pending.extend(other.pending);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub async fn deliver(self, sink: &NotificationSinkRef) {
        for notification in self.pending {
            let kind = notification.kind;
            let user = notification.user;
            if let Err(err) = sink.notify(notification).await {
                warn!(user, ?kind, error = %err, "notification delivery failed");
            }
        }
    }
}
