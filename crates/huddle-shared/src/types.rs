use serde::{Deserialize, Serialize};

use crate::constants::PRIVATE_ID_SEPARATOR;

/// Account identifier issued by the hosted auth backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a conversation.
///
/// Private chats use a deterministic composite of the two participant ids so
/// that every client derives the same id for the same pair; group chats use
/// a store-allocated push key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Composite id for the private chat between `a` and `b`.
    ///
    /// The two ids are sorted lexicographically before joining, so
    /// `private_for(a, b) == private_for(b, a)`.
    pub fn private_for(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a.as_str() <= b.as_str() {
            (a, b)
        } else {
            (b, a)
        };
        Self(format!(
            "{}{}{}",
            lo.as_str(),
            PRIVATE_ID_SEPARATOR,
            hi.as_str()
        ))
    }

    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a message within a conversation's log.
///
/// Always a store-allocated push key, so lexicographic order over message
/// ids matches allocation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether a conversation is a two-party private chat or an N-party group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_id_is_order_independent() {
        let a = UserId::from("uid-alice");
        let b = UserId::from("uid-bob");
        assert_eq!(
            ConversationId::private_for(&a, &b),
            ConversationId::private_for(&b, &a)
        );
        assert_eq!(
            ConversationId::private_for(&a, &b).as_str(),
            "uid-alice_uid-bob"
        );
    }

    #[test]
    fn private_id_differs_per_pair() {
        let a = UserId::from("a");
        let b = UserId::from("b");
        let c = UserId::from("c");
        assert_ne!(
            ConversationId::private_for(&a, &b),
            ConversationId::private_for(&a, &c)
        );
    }
}
