//! Contract of the remote hierarchical key-value store.
//!
//! The store holds a tree of JSON nodes. It offers no multi-key
//! transactions and no server-side joins; its one atomicity guarantee is
//! that a single multi-path write batch commits all-or-nothing. Everything
//! the repository does is built on that guarantee.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use huddle_shared::{LastMessageSnapshot, NodePath, NodeValue, UserConversationIndexEntry};

use crate::error::Result;

/// Ordering applied to a subscribed node's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotOrder {
    /// Ascending key order. Push keys make this creation order.
    #[default]
    Key,
    /// Most recently updated first.
    UpdatedAtDesc,
}

/// Parameters of a live subscription.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeQuery {
    pub order: SnapshotOrder,
    /// Keep only the most recent N children. Under [`SnapshotOrder::Key`]
    /// the window stays in ascending order.
    pub limit_last: Option<usize>,
}

/// One push event: every direct child of the subscribed node, in query
/// order. Events carry complete current values, not diffs.
pub type Snapshot = Vec<(String, NodeValue)>;

/// Field-level patch applied to an existing conversation-shaped node.
///
/// `hidden` and `pinned` only apply to index entries. A merge targeting an
/// absent node is skipped; the next full projection write recreates it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDelta {
    pub last_message: Option<LastMessageSnapshot>,
    pub updated_at: Option<DateTime<Utc>>,
    pub hidden: Option<bool>,
    pub pinned: Option<bool>,
}

/// One write in an atomic multi-path batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the node wholesale.
    Put(NodeValue),
    /// Replace an index entry's projected fields. An existing entry's
    /// user-local `pinned` flag is retained (field-masked set).
    PutIndex(UserConversationIndexEntry),
    /// Patch individual fields of an existing node.
    Merge(NodeDelta),
    /// Remove the node.
    Delete,
}

/// Atomic multi-path write: every op commits, or none does.
pub type WriteBatch = BTreeMap<NodePath, WriteOp>;

/// A live subscription to one node's children.
///
/// Dropping the handle tears the server-side subscription down.
pub struct NodeSubscription {
    snapshots: mpsc::Receiver<Snapshot>,
    _teardown: Box<dyn Send>,
}

impl NodeSubscription {
    pub fn new(snapshots: mpsc::Receiver<Snapshot>, teardown: Box<dyn Send>) -> Self {
        Self {
            snapshots,
            _teardown: teardown,
        }
    }

    /// Next push event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.snapshots.recv().await
    }
}

/// Thin wrapper around the remote store's primitives. The core never talks
/// to the network directly.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Read one node, `None` if absent.
    async fn read(&self, path: &NodePath) -> Result<Option<NodeValue>>;

    /// Commit an atomic multi-path batch.
    async fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    /// Allocate a child key under `path` whose lexicographic order matches
    /// allocation order.
    async fn push_key(&self, path: &NodePath) -> Result<String>;

    /// Open a live subscription to the direct children of `path`. The first
    /// event is the current state.
    async fn subscribe(&self, path: &NodePath, query: SubscribeQuery) -> Result<NodeSubscription>;
}
