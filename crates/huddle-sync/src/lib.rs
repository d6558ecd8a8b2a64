//! # huddle-sync
//!
//! The in-process side of the chat synchronization core: a [`ChatSyncStore`]
//! per signed-in user that reconciles repository push feeds with UI-driven
//! chat selection, fires inbound-message notifications, and enforces the
//! thin business rules (sole-admin protection, linked-account checks) that
//! sit above the mechanism-only repository.

pub mod config;
pub mod events;
pub mod store;

mod error;

pub use config::SyncConfig;
pub use error::SyncError;
pub use events::{MessageNotification, NotificationSink, SyncEvent};
pub use store::{ChatSyncStore, ContactLink, Selection};
