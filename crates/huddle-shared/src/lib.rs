//! # huddle-shared
//!
//! Data model for the team-chat synchronization core: typed identifiers,
//! the canonical [`Conversation`] record, the immutable [`Message`] log
//! entry, the per-user [`UserConversationIndexEntry`] projection, and the
//! closed [`NodeValue`] union that is the only shape ever written to or
//! read from the hierarchical realtime store.

pub mod constants;
pub mod model;
pub mod node;
pub mod types;

mod error;

pub use error::ModelError;
pub use model::*;
pub use node::{NodePath, NodeValue};
pub use types::{ConversationId, ConversationKind, MessageId, UserId};
