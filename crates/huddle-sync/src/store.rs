//! The chat sync store: one coherent in-process view per signed-in user.
//!
//! Reconciles two push feeds (the user's conversation list and the active
//! conversation's message window) with UI-driven selection. Lists are
//! replaced wholesale on every push; a selection generation counter makes
//! a push from a superseded subscription a provable no-op instead of a
//! corrupting write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use huddle_shared::constants::EVENT_BUFFER;
use huddle_shared::{
    Attachment, ConversationId, ConversationKind, Message, MessageKind,
    UserConversationIndexEntry, UserId,
};
use huddle_store::{ChatRepository, SubscriptionHandle};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{MessageNotification, NotificationSink, SyncEvent};

/// A CRM contact as the chat layer sees it: a display name plus the linked
/// account identifier, if the contact ever signed in.
#[derive(Debug, Clone)]
pub struct ContactLink {
    pub display_name: String,
    pub user_id: Option<UserId>,
}

/// Which conversation, if any, the user is looking at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// No active conversation.
    #[default]
    Idle,
    /// A message subscription is being established.
    Selecting(ConversationId),
    /// Live on one conversation.
    Active(ConversationId),
}

impl Selection {
    fn conversation(&self) -> Option<&ConversationId> {
        match self {
            Selection::Idle => None,
            Selection::Selecting(id) | Selection::Active(id) => Some(id),
        }
    }
}

#[derive(Default)]
struct Inner {
    user: Option<UserId>,
    selection: Selection,
    /// Bumped on every selection change; message pushes carrying an older
    /// generation are dropped.
    generation: u64,
    conversations: Vec<UserConversationIndexEntry>,
    messages: Vec<Message>,
    /// Last `updated_at` observed per conversation, for at-most-once
    /// notification per delta.
    last_seen: HashMap<ConversationId, DateTime<Utc>>,
    /// Whether the first list snapshot after init has been absorbed.
    seeded: bool,
    conv_sub: Option<SubscriptionHandle>,
    conv_task: Option<JoinHandle<()>>,
    msg_sub: Option<SubscriptionHandle>,
    msg_task: Option<JoinHandle<()>>,
}

/// In-process cache and subscription orchestrator for one user's chats.
///
/// Dependencies are constructor-injected, so independent instances can run
/// side by side (one per simulated client in tests).
pub struct ChatSyncStore {
    repo: Arc<ChatRepository>,
    sink: Arc<dyn NotificationSink>,
    config: SyncConfig,
    events: mpsc::Sender<SyncEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl ChatSyncStore {
    /// Build a store and the event stream the UI consumes.
    pub fn new(
        repo: Arc<ChatRepository>,
        sink: Arc<dyn NotificationSink>,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        (
            Self {
                repo,
                sink,
                config,
                events,
                inner: Arc::new(Mutex::new(Inner::default())),
            },
            events_rx,
        )
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the conversation-list subscription for `user`.
    ///
    /// Re-entrant no-op when already initialized for the same user;
    /// otherwise any previous state is torn down first.
    pub async fn init(&self, user: UserId) -> Result<(), SyncError> {
        {
            let state = self.lock();
            let alive = state.conv_task.as_ref().is_some_and(|t| !t.is_finished());
            if state.user.as_ref() == Some(&user) && alive {
                debug!(user = %user, "sync store already initialized");
                return Ok(());
            }
        }
        self.cleanup();

        let feed = self.repo.subscribe_user_conversations(&user).await?;
        let (rx, handle) = feed.into_parts();
        let task = tokio::spawn(pump_conversations(
            rx,
            user.clone(),
            self.inner.clone(),
            self.events.clone(),
            self.sink.clone(),
            self.config.clone(),
        ));

        let mut state = self.lock();
        state.user = Some(user);
        state.conv_sub = Some(handle);
        state.conv_task = Some(task);
        Ok(())
    }

    /// Switch the active conversation.
    ///
    /// No-op when already active on `conversation_id`. On failure the
    /// previous selection and its subscription stay untouched.
    pub async fn select_chat(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        let prior;
        {
            let mut state = self.lock();
            if state.user.is_none() {
                return Err(SyncError::NotInitialized);
            }
            if state.selection == Selection::Active(conversation_id.clone()) {
                return Ok(());
            }
            prior = std::mem::replace(
                &mut state.selection,
                Selection::Selecting(conversation_id.clone()),
            );
        }

        // Establish the new subscription before tearing the old one down,
        // so a failure leaves the prior view intact.
        let feed = match self
            .repo
            .subscribe_messages(&conversation_id, self.config.message_window)
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                self.lock().selection = prior;
                return Err(e.into());
            }
        };
        let (rx, handle) = feed.into_parts();

        let mut state = self.lock();
        if let Some(task) = state.msg_task.take() {
            task.abort();
        }
        state.msg_sub = None;
        state.messages.clear();
        state.generation += 1;
        let generation = state.generation;
        state.selection = Selection::Active(conversation_id.clone());
        state.msg_sub = Some(handle);
        state.msg_task = Some(tokio::spawn(pump_messages(
            rx,
            conversation_id,
            generation,
            self.inner.clone(),
            self.events.clone(),
        )));
        Ok(())
    }

    /// Leave the active conversation and drop its message window.
    pub fn clear_selection(&self) {
        let mut state = self.lock();
        if let Some(task) = state.msg_task.take() {
            task.abort();
        }
        state.msg_sub = None;
        state.messages.clear();
        state.generation += 1;
        state.selection = Selection::Idle;
    }

    /// Tear down both subscriptions and forget the signed-in user.
    pub fn cleanup(&self) {
        let mut state = self.lock();
        if let Some(task) = state.msg_task.take() {
            task.abort();
        }
        if let Some(task) = state.conv_task.take() {
            task.abort();
        }
        state.msg_sub = None;
        state.conv_sub = None;
        state.generation += 1;
        state.user = None;
        state.selection = Selection::Idle;
        state.conversations.clear();
        state.messages.clear();
        state.last_seen.clear();
        state.seeded = false;
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Send a message to `conversation_id` as the signed-in user.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        kind: MessageKind,
        attachments: Vec<Attachment>,
    ) -> Result<Message, SyncError> {
        let user = self.current_user().ok_or(SyncError::NotInitialized)?;
        let cached: Option<Vec<UserId>> = {
            let state = self.lock();
            state
                .conversations
                .iter()
                .find(|e| &e.conversation_id == conversation_id)
                .map(|e| e.participants.iter().cloned().collect())
        };
        let participants = match cached {
            Some(members) => members,
            None => self
                .repo
                .conversation(conversation_id)
                .await?
                .ok_or_else(|| SyncError::UnknownConversation(conversation_id.clone()))?
                .participants
                .into_iter()
                .collect(),
        };
        Ok(self
            .repo
            .send_message(conversation_id, &user, content, kind, &participants, attachments)
            .await?)
    }

    /// Start (or reopen) the private chat with a CRM contact.
    ///
    /// Refused before any write when the contact never linked an account.
    pub async fn start_private_chat(
        &self,
        contact: &ContactLink,
    ) -> Result<ConversationId, SyncError> {
        let user = self.current_user().ok_or(SyncError::NotInitialized)?;
        let other = contact
            .user_id
            .as_ref()
            .ok_or(SyncError::ParticipantNotLinked)?;
        Ok(self.repo.create_private_chat(&user, other).await?)
    }

    /// Create a group chat with the signed-in user as sole admin.
    pub async fn create_group_chat(
        &self,
        name: &str,
        members: &[UserId],
    ) -> Result<ConversationId, SyncError> {
        let user = self.current_user().ok_or(SyncError::NotInitialized)?;
        Ok(self.repo.create_group_chat(&user, name, members).await?)
    }

    /// Remove a member from a group.
    ///
    /// Removing the sole admin of a group that still has other members is
    /// refused before any write; promote someone first.
    pub async fn remove_participant(
        &self,
        conversation_id: &ConversationId,
        member: &UserId,
    ) -> Result<(), SyncError> {
        let conversation = self
            .repo
            .conversation(conversation_id)
            .await?
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.clone()))?;
        if conversation.kind == ConversationKind::Group
            && conversation.is_sole_admin(member)
            && conversation.participants.len() >= 2
        {
            return Err(SyncError::MustPromoteAdminFirst);
        }
        Ok(self.repo.remove_participant(conversation_id, member).await?)
    }

    /// Leave a group as the signed-in user. Same admin rule as
    /// [`remove_participant`](Self::remove_participant).
    pub async fn leave_group(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        let user = self.current_user().ok_or(SyncError::NotInitialized)?;
        self.remove_participant(conversation_id, &user).await
    }

    pub async fn add_participants(
        &self,
        conversation_id: &ConversationId,
        members: &[UserId],
    ) -> Result<(), SyncError> {
        Ok(self.repo.add_participants(conversation_id, members).await?)
    }

    pub async fn toggle_admin_status(
        &self,
        conversation_id: &ConversationId,
        member: &UserId,
        admin: bool,
    ) -> Result<(), SyncError> {
        Ok(self
            .repo
            .toggle_admin_status(conversation_id, member, admin)
            .await?)
    }

    pub async fn rename_or_rephoto(
        &self,
        conversation_id: &ConversationId,
        display_name: Option<&str>,
        photo_ref: Option<&str>,
    ) -> Result<(), SyncError> {
        Ok(self
            .repo
            .rename_or_rephoto(conversation_id, display_name, photo_ref)
            .await?)
    }

    /// Pin or unpin a conversation in the signed-in user's own list.
    pub async fn toggle_pin(
        &self,
        conversation_id: &ConversationId,
        pinned: bool,
    ) -> Result<(), SyncError> {
        let user = self.current_user().ok_or(SyncError::NotInitialized)?;
        Ok(self.repo.toggle_pin(conversation_id, &user, pinned).await?)
    }

    /// Hide or unhide a conversation in the signed-in user's own list.
    pub async fn set_hidden(
        &self,
        conversation_id: &ConversationId,
        hidden: bool,
    ) -> Result<(), SyncError> {
        let user = self.current_user().ok_or(SyncError::NotInitialized)?;
        Ok(self.repo.set_hidden(conversation_id, &user, hidden).await?)
    }

    // ------------------------------------------------------------------
    // Snapshot accessors
    // ------------------------------------------------------------------

    /// Current visible conversation list, pinned first, then most recent.
    pub fn conversations(&self) -> Vec<UserConversationIndexEntry> {
        self.lock().conversations.clone()
    }

    /// Current message window of the active conversation.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn selection(&self) -> Selection {
        self.lock().selection.clone()
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.lock().user.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("sync state poisoned")
    }
}

/// Absorb conversation-list pushes: replace the cached list wholesale,
/// fire at most one notification per advanced conversation, and forward
/// the ordered list to the UI.
async fn pump_conversations(
    mut rx: mpsc::Receiver<Vec<UserConversationIndexEntry>>,
    self_id: UserId,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Sender<SyncEvent>,
    sink: Arc<dyn NotificationSink>,
    config: SyncConfig,
) {
    while let Some(list) = rx.recv().await {
        let mut pending = Vec::new();
        let ordered = {
            let mut state = inner.lock().expect("sync state poisoned");
            let seeded = state.seeded;
            let active = state.selection.conversation().cloned();

            for entry in &list {
                let advanced = state
                    .last_seen
                    .get(&entry.conversation_id)
                    .map_or(true, |prev| entry.updated_at > *prev);
                if !advanced {
                    continue;
                }
                state
                    .last_seen
                    .insert(entry.conversation_id.clone(), entry.updated_at);

                // The first snapshot after init is absorbed silently.
                if !seeded {
                    continue;
                }
                let Some(snapshot) = &entry.last_message else {
                    continue;
                };
                if snapshot.sender_id == self_id {
                    continue;
                }
                if active.as_ref() == Some(&entry.conversation_id) {
                    continue;
                }
                if !config.notifications_enabled {
                    continue;
                }
                pending.push(MessageNotification {
                    title: entry
                        .display_name
                        .clone()
                        .unwrap_or_else(|| snapshot.sender_id.to_string()),
                    body: snapshot.preview.clone(),
                    link: format!("/chat/{}", entry.conversation_id),
                    sender_id: snapshot.sender_id.clone(),
                    conversation_id: entry.conversation_id.clone(),
                });
            }
            state.seeded = true;

            let mut ordered = list;
            // The feed arrives most-recent-first; pinned entries jump ahead.
            ordered.sort_by(|a, b| b.pinned.cmp(&a.pinned));
            state.conversations = ordered.clone();
            ordered
        };

        for notification in pending {
            debug!(conversation = %notification.conversation_id, "dispatching inbound-message notification");
            sink.notify(notification);
        }
        let _ = events.send(SyncEvent::ConversationsUpdated(ordered)).await;
    }
}

/// Absorb message-window pushes for one selection generation.
async fn pump_messages(
    mut rx: mpsc::Receiver<Vec<Message>>,
    conversation_id: ConversationId,
    generation: u64,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Sender<SyncEvent>,
) {
    while let Some(messages) = rx.recv().await {
        {
            let mut state = inner.lock().expect("sync state poisoned");
            if state.generation != generation {
                debug!(conversation = %conversation_id, "dropping push from superseded selection");
                break;
            }
            state.messages = messages.clone();
        }
        let _ = events
            .send(SyncEvent::MessagesUpdated {
                conversation_id: conversation_id.clone(),
                messages,
            })
            .await;
    }
}
