use tracing::info;
use uuid::Uuid;

use parley_types::models::Message;

/// Push-notification collaborator for participants with no live session.
/// Strictly fire-and-forget: implementations log failures and never return
/// them to the router.
pub trait PushDispatcher: Send + Sync {
    fn notify(&self, recipients: &[Uuid], message: &Message);
}

/// Default dispatcher: records the delivery in the log. Stands in for a real
/// FCM/APNs integration, which plugs in behind the same trait.
pub struct LogDispatcher;

impl PushDispatcher for LogDispatcher {
    fn notify(&self, recipients: &[Uuid], message: &Message) {
        for recipient in recipients {
            info!(
                "push: message {} in chat {} -> offline user {}",
                message.id, message.chat_id, recipient
            );
        }
    }
}
