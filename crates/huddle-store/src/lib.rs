//! # huddle-store
//!
//! The I/O boundary of the chat synchronization core.
//!
//! [`StorageAdapter`] wraps the remote hierarchical store's primitives
//! (read-node, atomic multi-path write-batch, subscribe-to-node, push-key
//! allocation); [`ChatRepository`] composes every chat mutation as a single
//! atomic batch over that contract and carries the self-healing merge logic
//! that keeps per-user index entries converging on the canonical record.
//! [`MemoryAdapter`] is the in-process adapter used by tests and local
//! development.

pub mod adapter;
pub mod blobs;
pub mod memory;
pub mod repository;

mod error;

pub use adapter::{
    NodeDelta, NodeSubscription, SnapshotOrder, StorageAdapter, SubscribeQuery, WriteBatch, WriteOp,
};
pub use blobs::{BlobStore, MemoryBlobStore};
pub use error::StoreError;
pub use memory::MemoryAdapter;
pub use repository::{ChatRepository, ConversationFeed, MessageFeed, SubscriptionHandle};
