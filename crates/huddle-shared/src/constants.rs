/// Maximum number of characters kept in a conversation-list message preview.
pub const MESSAGE_PREVIEW_MAX: usize = 80;

/// Default bounded window for a live message subscription.
pub const DEFAULT_MESSAGE_WINDOW: usize = 50;

/// Buffered snapshots per storage subscription channel.
pub const SNAPSHOT_BUFFER: usize = 32;

/// Buffered UI events per sync store instance.
pub const EVENT_BUFFER: usize = 64;

/// Length of the random suffix appended to allocated push keys.
pub const PUSH_KEY_SUFFIX_LEN: usize = 8;

/// Separator between the two sorted participant ids of a private chat id.
pub const PRIVATE_ID_SEPARATOR: char = '_';
