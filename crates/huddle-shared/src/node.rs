//! Node paths and the tagged value union of the hierarchical store.
//!
//! The store is a tree of JSON nodes addressed by slash-separated paths.
//! The core only ever touches three families of leaves:
//!
//! - `conversations/{conversation}` — canonical [`Conversation`] records
//! - `messages/{conversation}/{message}` — the append-only message log
//! - `user-conversations/{user}/{conversation}` — per-user index entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Conversation, Message, UserConversationIndexEntry};
use crate::types::{ConversationId, MessageId, UserId};

/// Slash-separated address of a node in the hierarchical store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(String);

impl NodePath {
    /// Canonical conversation record.
    pub fn conversation(id: &ConversationId) -> Self {
        Self(format!("conversations/{id}"))
    }

    /// Root of the conversations collection.
    pub fn conversations_root() -> Self {
        Self("conversations".to_string())
    }

    /// Root of one conversation's message log.
    pub fn message_log(id: &ConversationId) -> Self {
        Self(format!("messages/{id}"))
    }

    /// One message in a conversation's log.
    pub fn message(conversation: &ConversationId, message: &MessageId) -> Self {
        Self(format!("messages/{conversation}/{message}"))
    }

    /// Root of one user's conversation index.
    pub fn user_index(user: &UserId) -> Self {
        Self(format!("user-conversations/{user}"))
    }

    /// One user's index entry for one conversation.
    pub fn user_conversation(user: &UserId, conversation: &ConversationId) -> Self {
        Self(format!("user-conversations/{user}/{conversation}"))
    }

    /// Append a child key.
    pub fn child(&self, key: &str) -> Self {
        Self(format!("{}/{key}", self.0))
    }

    /// If `self` is a direct child of `root`, its final key segment.
    pub fn child_key<'a>(&'a self, root: &NodePath) -> Option<&'a str> {
        let rest = self.0.strip_prefix(&root.0)?.strip_prefix('/')?;
        (!rest.is_empty() && !rest.contains('/')).then_some(rest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed union of values crossing the storage adapter boundary.
///
/// Payloads are tagged so a node read from the wrong path family fails
/// decoding instead of leaking an untyped value into the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "node", rename_all = "kebab-case")]
pub enum NodeValue {
    Conversation(Conversation),
    Message(Message),
    IndexEntry(UserConversationIndexEntry),
}

impl NodeValue {
    /// The timestamp a subscription orders this value by: `updated_at` for
    /// conversation-shaped nodes, `created_at` for messages.
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            NodeValue::Conversation(c) => c.updated_at,
            NodeValue::Message(m) => m.created_at,
            NodeValue::IndexEntry(e) => e.updated_at,
        }
    }

    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeValue::Conversation(_) => "conversation",
            NodeValue::Message(_) => "message",
            NodeValue::IndexEntry(_) => "index-entry",
        }
    }
}
