//! UI-facing event stream and the notification dispatcher contract.

use huddle_shared::{ConversationId, Message, UserConversationIndexEntry, UserId};

/// Pushed to the UI layer whenever the coherent in-process view changes.
///
/// Lists are always delivered wholesale, never as patches, so a consumer
/// can replace its rendering state without merging.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The visible conversation list, pinned entries first, then most
    /// recently updated first.
    ConversationsUpdated(Vec<UserConversationIndexEntry>),
    /// The active conversation's message window, in creation order.
    MessagesUpdated {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
}

/// Payload handed to the notification dispatcher for an inbound message on
/// a non-active conversation.
#[derive(Debug, Clone)]
pub struct MessageNotification {
    pub title: String,
    pub body: String,
    /// In-app route of the conversation the notification links to.
    pub link: String,
    pub sender_id: UserId,
    pub conversation_id: ConversationId,
}

/// External collaborator rendering user-facing alerts. Fire-and-forget; no
/// acknowledgement comes back.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: MessageNotification);
}
