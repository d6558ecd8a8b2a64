use thiserror::Error;

use huddle_shared::ConversationId;
use huddle_store::StoreError;

/// Errors surfaced to the UI layer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The caller is the only admin of a group that still has members.
    #[error("promote another admin before leaving the group")]
    MustPromoteAdminFirst,

    /// The contact has no linked account identifier to chat with.
    #[error("participant has no linked account")]
    ParticipantNotLinked,

    /// The store has no signed-in user yet.
    #[error("chat sync store is not initialized")]
    NotInitialized,

    /// No such conversation in the cached list or the canonical store.
    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    /// Storage-level failure, propagated as-is. Retryable when the
    /// underlying error is.
    #[error(transparent)]
    Store(#[from] StoreError),
}
