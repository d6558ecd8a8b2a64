//! Chat repository: every chat mutation expressed as one atomic multi-path
//! batch over the storage adapter.
//!
//! The canonical conversation node is the source of truth; per-user index
//! entries are cached projections that only this repository writes. Full
//! projection rewrites are what keeps stale entries converging: every
//! operation that reads the canonical record rewrites the index entries it
//! touches from scratch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_shared::constants::SNAPSHOT_BUFFER;
use huddle_shared::{
    Attachment, Conversation, ConversationId, LastMessageSnapshot, Message, MessageKind, NodePath,
    NodeValue, UserConversationIndexEntry, UserId,
};

use crate::adapter::{
    NodeDelta, NodeSubscription, SnapshotOrder, StorageAdapter, SubscribeQuery, WriteBatch, WriteOp,
};
use crate::error::{Result, StoreError};

/// The I/O boundary for chat state.
///
/// Mechanism only: business rules (who may leave a group, who may be
/// messaged) live in the consuming layer. The repository performs whatever
/// batch it is asked to compose.
pub struct ChatRepository {
    adapter: Arc<dyn StorageAdapter>,
    /// Paths with a live feed, to catch double subscription without
    /// disposal.
    active_feeds: Arc<Mutex<HashSet<NodePath>>>,
}

impl ChatRepository {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            active_feeds: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create the private chat between `self_id` and `other`, or return the
    /// existing one.
    ///
    /// Both sides derive the same deterministic id, so concurrent calls
    /// converge on a single conversation: the full-object write is the same
    /// whichever caller lands last. When the conversation already exists
    /// the call degenerates into a repair batch that force-unhides both
    /// participants' index entries, covering an earlier run that crashed
    /// between creating the chat and making it visible.
    pub async fn create_private_chat(
        &self,
        self_id: &UserId,
        other: &UserId,
    ) -> Result<ConversationId> {
        let id = ConversationId::private_for(self_id, other);
        let path = NodePath::conversation(&id);

        match self.adapter.read(&path).await? {
            Some(NodeValue::Conversation(_)) => {
                let unhide = NodeDelta {
                    hidden: Some(false),
                    ..Default::default()
                };
                let mut batch = WriteBatch::new();
                batch.insert(
                    NodePath::user_conversation(self_id, &id),
                    WriteOp::Merge(unhide.clone()),
                );
                batch.insert(
                    NodePath::user_conversation(other, &id),
                    WriteOp::Merge(unhide),
                );
                self.adapter.write_batch(batch).await?;
                info!(conversation = %id, "private chat already exists, repaired visibility");
                Ok(id)
            }
            Some(node) => Err(StoreError::Corrupt {
                path: path.to_string(),
                reason: format!("expected conversation, found {}", node.tag()),
            }),
            None => {
                let conversation = Conversation::new_private(self_id, other, Utc::now());
                let mut batch = WriteBatch::new();
                // The chat stays hidden on the other side until the first
                // exchange.
                batch.insert(
                    NodePath::user_conversation(self_id, &id),
                    WriteOp::PutIndex(UserConversationIndexEntry::project(&conversation, false)),
                );
                batch.insert(
                    NodePath::user_conversation(other, &id),
                    WriteOp::PutIndex(UserConversationIndexEntry::project(&conversation, true)),
                );
                batch.insert(path, WriteOp::Put(NodeValue::Conversation(conversation)));
                self.adapter.write_batch(batch).await?;
                info!(conversation = %id, "private chat created");
                Ok(id)
            }
        }
    }

    /// Create a group chat with `self_id` as its sole admin.
    pub async fn create_group_chat(
        &self,
        self_id: &UserId,
        name: &str,
        participants: &[UserId],
    ) -> Result<ConversationId> {
        let key = self.adapter.push_key(&NodePath::conversations_root()).await?;
        let id = ConversationId::from_key(key);
        let conversation = Conversation::new_group(
            id.clone(),
            self_id,
            name,
            participants.iter().cloned(),
            Utc::now(),
        )?;

        let member_count = conversation.participants.len();
        let mut batch = WriteBatch::new();
        for member in &conversation.participants {
            batch.insert(
                NodePath::user_conversation(member, &id),
                WriteOp::PutIndex(UserConversationIndexEntry::project(&conversation, false)),
            );
        }
        batch.insert(
            NodePath::conversation(&id),
            WriteOp::Put(NodeValue::Conversation(conversation)),
        );
        self.adapter.write_batch(batch).await?;
        info!(conversation = %id, members = member_count, "group chat created");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append a message and refresh every participant's view of the
    /// conversation in one atomic batch.
    ///
    /// When the canonical record can be read, each index entry is rewritten
    /// wholesale from it, which also repairs any entry a previous partial
    /// write left stale. When the read fails the write still goes through
    /// as a degraded field-level patch of the entries named in
    /// `participants`; convergence then waits for the next full rewrite.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
        kind: MessageKind,
        participants: &[UserId],
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        let log = NodePath::message_log(conversation_id);
        let key = self.adapter.push_key(&log).await?;
        let now = Utc::now();
        let message = Message {
            id: key.into(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            kind,
            content: content.to_string(),
            created_at: now,
            attachments,
        };
        let snapshot = LastMessageSnapshot::for_message(&message);

        let conversation_path = NodePath::conversation(conversation_id);
        let canonical = match self.adapter.read(&conversation_path).await {
            Ok(Some(NodeValue::Conversation(c))) => Some(c),
            Ok(Some(node)) => {
                return Err(StoreError::Corrupt {
                    path: conversation_path.to_string(),
                    reason: format!("expected conversation, found {}", node.tag()),
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "canonical read failed, degrading to index patch");
                None
            }
        };

        let mut batch = WriteBatch::new();
        batch.insert(
            NodePath::message(conversation_id, &message.id),
            WriteOp::Put(NodeValue::Message(message.clone())),
        );

        let degraded = canonical.is_none();
        match canonical {
            Some(mut conversation) => {
                conversation.updated_at = bump(conversation.updated_at, now);
                conversation.last_message = Some(snapshot);
                for member in &conversation.participants {
                    batch.insert(
                        NodePath::user_conversation(member, conversation_id),
                        WriteOp::PutIndex(UserConversationIndexEntry::project(
                            &conversation,
                            false,
                        )),
                    );
                }
                batch.insert(
                    conversation_path,
                    WriteOp::Put(NodeValue::Conversation(conversation)),
                );
            }
            None => {
                let delta = NodeDelta {
                    last_message: Some(snapshot),
                    updated_at: Some(now),
                    ..Default::default()
                };
                batch.insert(conversation_path, WriteOp::Merge(delta.clone()));
                for member in participants {
                    batch.insert(
                        NodePath::user_conversation(member, conversation_id),
                        WriteOp::Merge(NodeDelta {
                            hidden: Some(false),
                            ..delta.clone()
                        }),
                    );
                }
            }
        }

        self.adapter.write_batch(batch).await?;
        if degraded {
            warn!(message = %message.id, conversation = %conversation_id, "message sent with degraded index patch");
        } else {
            info!(message = %message.id, conversation = %conversation_id, "message sent");
        }
        Ok(message)
    }

    // ------------------------------------------------------------------
    // Membership and metadata
    // ------------------------------------------------------------------

    /// Add members to a conversation and rewrite every member's index
    /// entry.
    pub async fn add_participants(
        &self,
        conversation_id: &ConversationId,
        new_members: &[UserId],
    ) -> Result<()> {
        let mut conversation = self.canonical(conversation_id).await?;
        for member in new_members {
            conversation.participants.insert(member.clone());
        }
        conversation.updated_at = bump(conversation.updated_at, Utc::now());
        self.rewrite_all(conversation).await?;
        info!(conversation = %conversation_id, added = new_members.len(), "participants added");
        Ok(())
    }

    /// Remove one member: their index entry is deleted, everyone else's is
    /// rewritten. Whether the removal is allowed is the caller's rule.
    pub async fn remove_participant(
        &self,
        conversation_id: &ConversationId,
        member: &UserId,
    ) -> Result<()> {
        let mut conversation = self.canonical(conversation_id).await?;
        conversation.participants.remove(member);
        conversation.admins.remove(member);
        conversation.updated_at = bump(conversation.updated_at, Utc::now());

        let mut batch = WriteBatch::new();
        batch.insert(
            NodePath::user_conversation(member, conversation_id),
            WriteOp::Delete,
        );
        for remaining in &conversation.participants {
            batch.insert(
                NodePath::user_conversation(remaining, conversation_id),
                WriteOp::PutIndex(UserConversationIndexEntry::project(&conversation, false)),
            );
        }
        batch.insert(
            NodePath::conversation(conversation_id),
            WriteOp::Put(NodeValue::Conversation(conversation)),
        );
        self.adapter.write_batch(batch).await?;
        info!(conversation = %conversation_id, member = %member, "participant removed");
        Ok(())
    }

    /// Grant or revoke admin status.
    pub async fn toggle_admin_status(
        &self,
        conversation_id: &ConversationId,
        member: &UserId,
        admin: bool,
    ) -> Result<()> {
        let mut conversation = self.canonical(conversation_id).await?;
        conversation.set_admin(member, admin)?;
        conversation.updated_at = bump(conversation.updated_at, Utc::now());
        self.rewrite_all(conversation).await?;
        info!(conversation = %conversation_id, member = %member, admin, "admin status changed");
        Ok(())
    }

    /// Update a group's display name and/or photo.
    pub async fn rename_or_rephoto(
        &self,
        conversation_id: &ConversationId,
        display_name: Option<&str>,
        photo_ref: Option<&str>,
    ) -> Result<()> {
        let mut conversation = self.canonical(conversation_id).await?;
        conversation.rename(display_name, photo_ref)?;
        conversation.updated_at = bump(conversation.updated_at, Utc::now());
        self.rewrite_all(conversation).await?;
        info!(conversation = %conversation_id, "group renamed");
        Ok(())
    }

    /// Pin or unpin a conversation in one user's own list. User-local: no
    /// canonical touch, no `updated_at` bump for anyone else.
    pub async fn toggle_pin(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        pinned: bool,
    ) -> Result<()> {
        self.merge_own_entry(
            conversation_id,
            user,
            NodeDelta {
                pinned: Some(pinned),
                ..Default::default()
            },
        )
        .await?;
        debug!(conversation = %conversation_id, user = %user, pinned, "pin toggled");
        Ok(())
    }

    /// Hide or unhide a conversation in one user's own list.
    pub async fn set_hidden(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        hidden: bool,
    ) -> Result<()> {
        self.merge_own_entry(
            conversation_id,
            user,
            NodeDelta {
                hidden: Some(hidden),
                ..Default::default()
            },
        )
        .await?;
        debug!(conversation = %conversation_id, user = %user, hidden, "visibility toggled");
        Ok(())
    }

    /// One-shot canonical read, `None` if the conversation does not exist.
    pub async fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>> {
        let path = NodePath::conversation(conversation_id);
        match self.adapter.read(&path).await? {
            Some(NodeValue::Conversation(c)) => Ok(Some(c)),
            Some(node) => Err(StoreError::Corrupt {
                path: path.to_string(),
                reason: format!("expected conversation, found {}", node.tag()),
            }),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Live feed of one user's visible conversation list, most recently
    /// updated first. Hidden entries are filtered out.
    ///
    /// The previous feed for the same user must be disposed before
    /// re-subscribing; debug builds panic on a duplicate.
    pub async fn subscribe_user_conversations(
        &self,
        user_id: &UserId,
    ) -> Result<ConversationFeed> {
        let root = NodePath::user_index(user_id);
        self.claim(&root);
        let query = SubscribeQuery {
            order: SnapshotOrder::UpdatedAtDesc,
            limit_last: None,
        };
        let sub = match self.adapter.subscribe(&root, query).await {
            Ok(sub) => sub,
            Err(e) => {
                self.release(&root);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let task = tokio::spawn(pump_conversations(sub, tx));
        debug!(user = %user_id, "conversation-list subscription opened");
        Ok(ConversationFeed {
            rx,
            handle: SubscriptionHandle {
                path: root,
                registry: self.active_feeds.clone(),
                task,
            },
        })
    }

    /// Live feed of the most recent `window` messages of one conversation,
    /// in creation order.
    pub async fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
        window: usize,
    ) -> Result<MessageFeed> {
        let root = NodePath::message_log(conversation_id);
        self.claim(&root);
        let query = SubscribeQuery {
            order: SnapshotOrder::Key,
            limit_last: Some(window),
        };
        let sub = match self.adapter.subscribe(&root, query).await {
            Ok(sub) => sub,
            Err(e) => {
                self.release(&root);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let task = tokio::spawn(pump_messages(sub, tx));
        debug!(conversation = %conversation_id, window, "message subscription opened");
        Ok(MessageFeed {
            rx,
            handle: SubscriptionHandle {
                path: root,
                registry: self.active_feeds.clone(),
                task,
            },
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn canonical(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        self.conversation(conversation_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))
    }

    /// Write the canonical record plus a fresh projection for every
    /// participant.
    async fn rewrite_all(&self, conversation: Conversation) -> Result<()> {
        let mut batch = WriteBatch::new();
        for member in &conversation.participants {
            batch.insert(
                NodePath::user_conversation(member, &conversation.id),
                WriteOp::PutIndex(UserConversationIndexEntry::project(&conversation, false)),
            );
        }
        batch.insert(
            NodePath::conversation(&conversation.id),
            WriteOp::Put(NodeValue::Conversation(conversation)),
        );
        self.adapter.write_batch(batch).await
    }

    async fn merge_own_entry(
        &self,
        conversation_id: &ConversationId,
        user: &UserId,
        delta: NodeDelta,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.insert(
            NodePath::user_conversation(user, conversation_id),
            WriteOp::Merge(delta),
        );
        self.adapter.write_batch(batch).await
    }

    fn claim(&self, path: &NodePath) {
        let mut active = self.active_feeds.lock().expect("feed registry poisoned");
        if !active.insert(path.clone()) {
            warn!(%path, "subscription opened twice without disposal");
            debug_assert!(
                false,
                "feed for {path} is still active; unsubscribe it before re-subscribing"
            );
        }
    }

    fn release(&self, path: &NodePath) {
        if let Ok(mut active) = self.active_feeds.lock() {
            active.remove(path);
        }
    }
}

/// New `updated_at` for a mutation: wall clock, clamped so the record never
/// moves backwards under client clock skew.
fn bump(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + Duration::milliseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

async fn pump_conversations(
    mut sub: NodeSubscription,
    tx: mpsc::Sender<Vec<UserConversationIndexEntry>>,
) {
    while let Some(snapshot) = sub.recv().await {
        let mut entries: Vec<UserConversationIndexEntry> = snapshot
            .into_iter()
            .filter_map(|(key, value)| match value {
                NodeValue::IndexEntry(entry) => Some(entry),
                other => {
                    warn!(%key, kind = other.tag(), "ignoring non-index node in user index");
                    None
                }
            })
            .filter(|entry| !entry.hidden)
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if tx.send(entries).await.is_err() {
            break;
        }
    }
}

async fn pump_messages(mut sub: NodeSubscription, tx: mpsc::Sender<Vec<Message>>) {
    while let Some(snapshot) = sub.recv().await {
        let messages: Vec<Message> = snapshot
            .into_iter()
            .filter_map(|(key, value)| match value {
                NodeValue::Message(message) => Some(message),
                other => {
                    warn!(%key, kind = other.tag(), "ignoring non-message node in log");
                    None
                }
            })
            .collect();
        if tx.send(messages).await.is_err() {
            break;
        }
    }
}

/// Tears a feed down: releases the duplicate-subscription claim and stops
/// the pump task, which drops the adapter-side subscription.
pub struct SubscriptionHandle {
    path: NodePath,
    registry: Arc<Mutex<HashSet<NodePath>>>,
    task: JoinHandle<()>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Ok(mut active) = self.registry.lock() {
            active.remove(&self.path);
        }
        self.task.abort();
    }
}

/// Live, re-sorted view of one user's conversation list.
pub struct ConversationFeed {
    rx: mpsc::Receiver<Vec<UserConversationIndexEntry>>,
    handle: SubscriptionHandle,
}

impl ConversationFeed {
    /// Next full list, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<Vec<UserConversationIndexEntry>> {
        self.rx.recv().await
    }

    /// Tear the subscription down. Dropping the feed does the same; this
    /// exists so call sites can name the intent.
    pub fn unsubscribe(self) {}

    /// Split into the snapshot stream and the teardown handle, for callers
    /// that pump the stream from their own task but need synchronous
    /// teardown.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<Vec<UserConversationIndexEntry>>,
        SubscriptionHandle,
    ) {
        (self.rx, self.handle)
    }
}

/// Live bounded window over one conversation's message log.
pub struct MessageFeed {
    rx: mpsc::Receiver<Vec<Message>>,
    handle: SubscriptionHandle,
}

impl MessageFeed {
    /// Next full window, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<Vec<Message>> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}

    pub fn into_parts(self) -> (mpsc::Receiver<Vec<Message>>, SubscriptionHandle) {
        (self.rx, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::memory::MemoryAdapter;
    use futures::future::join_all;

    fn repo_pair() -> (MemoryAdapter, ChatRepository) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let adapter = MemoryAdapter::new();
        let repo = ChatRepository::new(Arc::new(adapter.clone()));
        (adapter, repo)
    }

    async fn entry(
        adapter: &MemoryAdapter,
        user: &UserId,
        conversation: &ConversationId,
    ) -> Option<UserConversationIndexEntry> {
        match adapter
            .read(&NodePath::user_conversation(user, conversation))
            .await
            .unwrap()
        {
            Some(NodeValue::IndexEntry(e)) => Some(e),
            None => None,
            other => panic!("unexpected node: {other:?}"),
        }
    }

    async fn canonical(adapter: &MemoryAdapter, id: &ConversationId) -> Conversation {
        match adapter.read(&NodePath::conversation(id)).await.unwrap() {
            Some(NodeValue::Conversation(c)) => c,
            other => panic!("unexpected node: {other:?}"),
        }
    }

    #[tokio::test]
    async fn private_chat_hidden_from_other_side_until_repair() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");

        let id = repo.create_private_chat(&a, &b).await.unwrap();
        assert!(!entry(&adapter, &a, &id).await.unwrap().hidden);
        assert!(entry(&adapter, &b, &id).await.unwrap().hidden);

        // Second creation, from either side, repairs visibility.
        let again = repo.create_private_chat(&b, &a).await.unwrap();
        assert_eq!(again, id);
        assert!(!entry(&adapter, &a, &id).await.unwrap().hidden);
        assert!(!entry(&adapter, &b, &id).await.unwrap().hidden);
    }

    #[tokio::test]
    async fn concurrent_private_creation_converges_to_one_conversation() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");

        let ids = join_all([
            repo.create_private_chat(&a, &b),
            repo.create_private_chat(&b, &a),
            repo.create_private_chat(&a, &b),
            repo.create_private_chat(&b, &a),
        ])
        .await;

        let first = ids[0].as_ref().unwrap().clone();
        for id in &ids {
            assert_eq!(id.as_ref().unwrap(), &first);
        }
        let conv = canonical(&adapter, &first).await;
        assert_eq!(conv.participants.len(), 2);
        assert!(entry(&adapter, &a, &first).await.is_some());
        assert!(entry(&adapter, &b, &first).await.is_some());
    }

    #[tokio::test]
    async fn send_message_refreshes_every_participant_atomically() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let id = repo.create_private_chat(&a, &b).await.unwrap();
        let before = canonical(&adapter, &id).await.updated_at;

        let message = repo
            .send_message(&id, &a, "hi", MessageKind::Text, &[a.clone(), b.clone()], Vec::new())
            .await
            .unwrap();

        for user in [&a, &b] {
            let e = entry(&adapter, user, &id).await.unwrap();
            let snap = e.last_message.expect("snapshot missing");
            assert_eq!(snap.preview, "hi");
            assert_eq!(snap.sender_id, a);
            assert!(!e.hidden);
            assert!(e.updated_at > before);
        }
        let conv = canonical(&adapter, &id).await;
        assert_eq!(conv.last_message.unwrap().preview, "hi");
        assert_eq!(conv.updated_at, entry(&adapter, &a, &id).await.unwrap().updated_at);
        assert_eq!(message.conversation_id, id);
    }

    #[tokio::test]
    async fn updated_at_strictly_increases_across_rapid_sends() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let id = repo.create_private_chat(&a, &b).await.unwrap();
        let members = [a.clone(), b.clone()];

        let mut previous = canonical(&adapter, &id).await.updated_at;
        for i in 0..5 {
            repo.send_message(&id, &a, &format!("m{i}"), MessageKind::Text, &members, Vec::new())
                .await
                .unwrap();
            let current = canonical(&adapter, &id).await.updated_at;
            assert!(current > previous);
            previous = current;
        }
    }

    #[tokio::test]
    async fn full_rewrite_heals_a_desynchronized_entry() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let c = UserId::from("c");
        let id = repo
            .create_group_chat(&a, "Ops", &[b.clone(), c.clone()])
            .await
            .unwrap();

        // Desynchronize B's entry, simulating a partial write.
        let mut stale = entry(&adapter, &b, &id).await.unwrap();
        stale.display_name = Some("old name".into());
        stale.participants.remove(&c);
        let mut batch = WriteBatch::new();
        batch.insert(
            NodePath::user_conversation(&b, &id),
            WriteOp::Put(NodeValue::IndexEntry(stale)),
        );
        adapter.write_batch(batch).await.unwrap();
        let conv = canonical(&adapter, &id).await;
        assert!(!entry(&adapter, &b, &id).await.unwrap().matches_canonical(&conv));

        repo.rename_or_rephoto(&id, Some("Ops 2.0"), None).await.unwrap();

        let conv = canonical(&adapter, &id).await;
        for user in [&a, &b, &c] {
            let e = entry(&adapter, user, &id).await.unwrap();
            assert!(e.matches_canonical(&conv));
            assert_eq!(e.display_name.as_deref(), Some("Ops 2.0"));
        }
    }

    #[tokio::test]
    async fn degraded_send_patches_and_later_send_heals() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let id = repo.create_private_chat(&a, &b).await.unwrap();
        let members = [a.clone(), b.clone()];

        // Desynchronize B's entry first.
        let mut stale = entry(&adapter, &b, &id).await.unwrap();
        stale.photo_ref = Some("stale.png".into());
        let mut batch = WriteBatch::new();
        batch.insert(
            NodePath::user_conversation(&b, &id),
            WriteOp::Put(NodeValue::IndexEntry(stale)),
        );
        adapter.write_batch(batch).await.unwrap();

        let flaky = FlakyAdapter::over(adapter.clone());
        let degraded_repo = ChatRepository::new(Arc::new(flaky.clone()));
        flaky.fail_reads.store(true, Ordering::SeqCst);
        degraded_repo
            .send_message(&id, &a, "patched", MessageKind::Text, &members, Vec::new())
            .await
            .unwrap();

        // The patch refreshed the preview but could not repair the stale
        // field.
        let e = entry(&adapter, &b, &id).await.unwrap();
        assert_eq!(e.last_message.as_ref().unwrap().preview, "patched");
        assert_eq!(e.photo_ref.as_deref(), Some("stale.png"));
        let conv = canonical(&adapter, &id).await;
        assert_eq!(conv.last_message.as_ref().unwrap().preview, "patched");
        assert!(!e.matches_canonical(&conv));

        // The next healthy send rewrites the projection wholesale.
        flaky.fail_reads.store(false, Ordering::SeqCst);
        degraded_repo
            .send_message(&id, &a, "healed", MessageKind::Text, &members, Vec::new())
            .await
            .unwrap();
        let conv = canonical(&adapter, &id).await;
        let e = entry(&adapter, &b, &id).await.unwrap();
        assert!(e.matches_canonical(&conv));
        assert_eq!(e.photo_ref, None);
    }

    #[tokio::test]
    async fn pinned_survives_full_rewrites() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let id = repo.create_private_chat(&a, &b).await.unwrap();

        repo.toggle_pin(&id, &b, true).await.unwrap();
        repo.send_message(&id, &a, "hi", MessageKind::Text, &[a.clone(), b.clone()], Vec::new())
            .await
            .unwrap();

        let e = entry(&adapter, &b, &id).await.unwrap();
        assert!(e.pinned);
        assert!(!e.hidden);
        assert!(!entry(&adapter, &a, &id).await.unwrap().pinned);
    }

    #[tokio::test]
    async fn remove_participant_deletes_their_entry() {
        let (adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let c = UserId::from("c");
        let id = repo
            .create_group_chat(&a, "Ops", &[b.clone(), c.clone()])
            .await
            .unwrap();

        repo.toggle_admin_status(&id, &b, true).await.unwrap();
        repo.remove_participant(&id, &a).await.unwrap();

        let conv = canonical(&adapter, &id).await;
        assert_eq!(conv.participants, [b.clone(), c.clone()].into());
        assert_eq!(conv.admins, [b.clone()].into());
        assert!(entry(&adapter, &a, &id).await.is_none());
        for user in [&b, &c] {
            assert!(entry(&adapter, user, &id).await.unwrap().matches_canonical(&conv));
        }
    }

    #[tokio::test]
    async fn conversation_feed_filters_hidden_and_sorts_by_recency() {
        let (_adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let c = UserId::from("c");

        let mut feed = repo.subscribe_user_conversations(&b).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), Vec::new());

        // Creation keeps the chat hidden on B's side.
        let ab = repo.create_private_chat(&a, &b).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), Vec::new());

        repo.send_message(&ab, &a, "hi", MessageKind::Text, &[a.clone(), b.clone()], Vec::new())
            .await
            .unwrap();
        let list = feed.recv().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].conversation_id, ab);

        // A second conversation with a newer message sorts first.
        let cb = repo.create_private_chat(&c, &b).await.unwrap();
        let _ = feed.recv().await.unwrap();
        repo.send_message(&cb, &c, "yo", MessageKind::Text, &[c.clone(), b.clone()], Vec::new())
            .await
            .unwrap();
        let list = feed.recv().await.unwrap();
        assert_eq!(
            list.iter().map(|e| e.conversation_id.clone()).collect::<Vec<_>>(),
            vec![cb, ab]
        );
    }

    #[tokio::test]
    async fn message_feed_is_windowed_and_ordered() {
        let (_adapter, repo) = repo_pair();
        let a = UserId::from("a");
        let b = UserId::from("b");
        let id = repo.create_private_chat(&a, &b).await.unwrap();
        let members = [a.clone(), b.clone()];

        for i in 0..7 {
            repo.send_message(&id, &a, &format!("m{i}"), MessageKind::Text, &members, Vec::new())
                .await
                .unwrap();
        }

        let mut feed = repo.subscribe_messages(&id, 5).await.unwrap();
        let window = feed.recv().await.unwrap();
        let contents: Vec<_> = window.iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4", "m5", "m6"]);
        for pair in window.windows(2) {
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[tokio::test]
    #[should_panic(expected = "still active")]
    async fn duplicate_subscription_without_disposal_panics_in_debug() {
        let (_adapter, repo) = repo_pair();
        let user = UserId::from("a");
        let _feed = repo.subscribe_user_conversations(&user).await.unwrap();
        let _ = repo.subscribe_user_conversations(&user).await;
    }

    #[tokio::test]
    async fn resubscribing_after_unsubscribe_is_clean() {
        let (_adapter, repo) = repo_pair();
        let user = UserId::from("a");
        let feed = repo.subscribe_user_conversations(&user).await.unwrap();
        feed.unsubscribe();
        let mut feed = repo.subscribe_user_conversations(&user).await.unwrap();
        assert_eq!(feed.recv().await.unwrap(), Vec::new());
    }

    /// Wraps the in-memory adapter and fails reads on demand.
    #[derive(Clone)]
    struct FlakyAdapter {
        inner: MemoryAdapter,
        fail_reads: Arc<AtomicBool>,
    }

    impl FlakyAdapter {
        fn over(inner: MemoryAdapter) -> Self {
            Self {
                inner,
                fail_reads: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait::async_trait]
    impl StorageAdapter for FlakyAdapter {
        async fn read(&self, path: &NodePath) -> Result<Option<NodeValue>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("injected read failure".into()));
            }
            self.inner.read(path).await
        }

        async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
            self.inner.write_batch(batch).await
        }

        async fn push_key(&self, path: &NodePath) -> Result<String> {
            self.inner.push_key(path).await
        }

        async fn subscribe(
            &self,
            path: &NodePath,
            query: SubscribeQuery,
        ) -> Result<NodeSubscription> {
            self.inner.subscribe(path, query).await
        }
    }
}
