use thiserror::Error;

use crate::types::{ConversationId, UserId};

/// Violations of the data model's structural invariants.
#[derive(Error, Debug)]
pub enum ModelError {
    /// A group needs at least two members.
    #[error("a group conversation needs at least two participants")]
    NotEnoughParticipants,

    /// Admins must be drawn from the participant set.
    #[error("cannot make {0} an admin: not a participant")]
    AdminNotParticipant(UserId),

    /// Display name and photo only exist on group conversations.
    #[error("conversation {0} is not a group")]
    NotAGroup(ConversationId),
}
