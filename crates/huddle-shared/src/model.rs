//! Domain records stored in the hierarchical realtime store.
//!
//! Every struct derives `Serialize` and `Deserialize`; these exact shapes
//! are what crosses the storage adapter boundary as tagged [`NodeValue`]s.
//!
//! [`NodeValue`]: crate::node::NodeValue

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MESSAGE_PREVIEW_MAX;
use crate::error::ModelError;
use crate::types::{ConversationId, ConversationKind, MessageId, UserId};

// ---------------------------------------------------------------------------
// Conversation (canonical record)
// ---------------------------------------------------------------------------

/// The single authoritative record of a chat's metadata.
///
/// Index entries are projections of this record; whenever the two disagree
/// after quiescence, this record wins and the next full-rewrite operation
/// overwrites the stale projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Current members. Never empty at creation; a group everyone has left
    /// keeps its record but becomes inert.
    pub participants: BTreeSet<UserId>,
    /// Subset of `participants`; empty for private chats.
    pub admins: BTreeSet<UserId>,
    /// Group display name. Absent for private chats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Group photo reference (blob URL). Absent for private chats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
    /// Denormalized copy of the most recent message, so list rendering never
    /// joins against the message log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageSnapshot>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    /// Monotonically non-decreasing; bumped on every mutation.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Build a fresh two-party private conversation.
    pub fn new_private(creator: &UserId, other: &UserId, now: DateTime<Utc>) -> Self {
        let id = ConversationId::private_for(creator, other);
        let participants: BTreeSet<UserId> = [creator.clone(), other.clone()].into();
        Self {
            id,
            kind: ConversationKind::Private,
            participants,
            admins: BTreeSet::new(),
            display_name: None,
            photo_ref: None,
            last_message: None,
            created_by: creator.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a fresh group conversation with the creator as sole admin.
    ///
    /// The creator is always a participant, whether or not it appears in
    /// `participants`.
    pub fn new_group(
        id: ConversationId,
        creator: &UserId,
        name: impl Into<String>,
        participants: impl IntoIterator<Item = UserId>,
        now: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let mut members: BTreeSet<UserId> = participants.into_iter().collect();
        members.insert(creator.clone());
        if members.len() < 2 {
            return Err(ModelError::NotEnoughParticipants);
        }
        Ok(Self {
            id,
            kind: ConversationKind::Group,
            participants: members,
            admins: [creator.clone()].into(),
            display_name: Some(name.into()),
            photo_ref: None,
            last_message: None,
            created_by: creator.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether `user` is the only admin of this conversation.
    pub fn is_sole_admin(&self, user: &UserId) -> bool {
        self.admins.len() == 1 && self.admins.contains(user)
    }

    /// Grant or revoke admin status. Promoting a non-member is refused.
    pub fn set_admin(&mut self, user: &UserId, admin: bool) -> Result<(), ModelError> {
        if admin {
            if !self.participants.contains(user) {
                return Err(ModelError::AdminNotParticipant(user.clone()));
            }
            self.admins.insert(user.clone());
        } else {
            self.admins.remove(user);
        }
        Ok(())
    }

    /// Update the group-only display fields. `None` leaves a field unchanged.
    pub fn rename(
        &mut self,
        display_name: Option<&str>,
        photo_ref: Option<&str>,
    ) -> Result<(), ModelError> {
        if self.kind != ConversationKind::Group {
            return Err(ModelError::NotAGroup(self.id.clone()));
        }
        if let Some(name) = display_name {
            self.display_name = Some(name.to_string());
        }
        if let Some(photo) = photo_ref {
            self.photo_ref = Some(photo.to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Payload category of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Audio,
    System,
}

/// A resolved attachment reference. The bytes live in the blob store; only
/// the stable URL is kept here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// One entry in a conversation's message log. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Push key; lexicographic order over ids matches creation order.
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    /// Text body, or a resolved blob reference for media messages.
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

// ---------------------------------------------------------------------------
// Last-message snapshot
// ---------------------------------------------------------------------------

/// Denormalized preview of a conversation's most recent message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastMessageSnapshot {
    pub preview: String,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    pub kind: MessageKind,
}

impl LastMessageSnapshot {
    pub fn for_message(message: &Message) -> Self {
        Self {
            preview: truncate_preview(&message.content),
            sender_id: message.sender_id.clone(),
            created_at: message.created_at,
            kind: message.kind,
        }
    }
}

/// Truncate message content for list previews.
fn truncate_preview(content: &str) -> String {
    if content.chars().count() <= MESSAGE_PREVIEW_MAX {
        return content.to_string();
    }
    let mut preview: String = content.chars().take(MESSAGE_PREVIEW_MAX - 1).collect();
    preview.push('\u{2026}');
    preview
}

// ---------------------------------------------------------------------------
// Per-user index entry
// ---------------------------------------------------------------------------

/// The per-user materialized view of one conversation.
///
/// A structural copy of the canonical fields needed for list rendering,
/// plus the two fields that exist only at this granularity: `hidden` and
/// `pinned`. Written only by the chat repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserConversationIndexEntry {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub participants: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageSnapshot>,
    pub updated_at: DateTime<Utc>,
    /// User-local visibility. A private chat stays hidden from the other
    /// party's list until the first exchange.
    #[serde(default)]
    pub hidden: bool,
    /// User-local ordering override.
    #[serde(default)]
    pub pinned: bool,
}

impl UserConversationIndexEntry {
    /// Project the canonical record into a fresh index entry.
    ///
    /// `pinned` defaults to `false` here; the store-level projection write
    /// retains an existing entry's flag.
    pub fn project(conversation: &Conversation, hidden: bool) -> Self {
        Self {
            conversation_id: conversation.id.clone(),
            kind: conversation.kind,
            participants: conversation.participants.clone(),
            display_name: conversation.display_name.clone(),
            photo_ref: conversation.photo_ref.clone(),
            last_message: conversation.last_message.clone(),
            updated_at: conversation.updated_at,
            hidden,
            pinned: false,
        }
    }

    /// Whether this entry equals the projection of `conversation`, ignoring
    /// the user-local `hidden` and `pinned` flags.
    pub fn matches_canonical(&self, conversation: &Conversation) -> bool {
        let mut projected = Self::project(conversation, self.hidden);
        projected.pinned = self.pinned;
        *self == projected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn new_group_always_includes_creator() {
        let creator = UserId::from("a");
        let conv = Conversation::new_group(
            ConversationId::from_key("g1"),
            &creator,
            "Ops",
            [UserId::from("b"), UserId::from("c")],
            now(),
        )
        .unwrap();
        assert!(conv.participants.contains(&creator));
        assert_eq!(conv.admins, [creator].into());
        assert_eq!(conv.display_name.as_deref(), Some("Ops"));
    }

    #[test]
    fn new_group_rejects_solo_membership() {
        let creator = UserId::from("a");
        let err = Conversation::new_group(
            ConversationId::from_key("g1"),
            &creator,
            "Just me",
            [creator.clone()],
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::NotEnoughParticipants));
    }

    #[test]
    fn set_admin_rejects_non_member() {
        let a = UserId::from("a");
        let mut conv = Conversation::new_group(
            ConversationId::from_key("g1"),
            &a,
            "Ops",
            [UserId::from("b")],
            now(),
        )
        .unwrap();
        let outsider = UserId::from("z");
        assert!(conv.set_admin(&outsider, true).is_err());
        assert!(conv.set_admin(&UserId::from("b"), true).is_ok());
        assert!(!conv.is_sole_admin(&a));
    }

    #[test]
    fn rename_refused_for_private() {
        let mut conv = Conversation::new_private(&UserId::from("a"), &UserId::from("b"), now());
        assert!(matches!(
            conv.rename(Some("nope"), None),
            Err(ModelError::NotAGroup(_))
        ));
    }

    #[test]
    fn preview_truncates_long_content() {
        let long = "x".repeat(500);
        let preview = truncate_preview(&long);
        assert_eq!(preview.chars().count(), MESSAGE_PREVIEW_MAX);
        assert!(preview.ends_with('\u{2026}'));
        assert_eq!(truncate_preview("short"), "short");
    }

    #[test]
    fn projection_matches_modulo_user_local_fields() {
        let a = UserId::from("a");
        let b = UserId::from("b");
        let conv = Conversation::new_private(&a, &b, now());

        let mut entry = UserConversationIndexEntry::project(&conv, true);
        entry.pinned = true;
        assert!(entry.matches_canonical(&conv));

        entry.display_name = Some("stale".into());
        assert!(!entry.matches_canonical(&conv));
    }
}
