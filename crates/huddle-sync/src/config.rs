//! Sync store configuration loaded from environment variables.
//!
//! Every setting has a default, so the store runs with zero configuration.

use huddle_shared::constants::DEFAULT_MESSAGE_WINDOW;

/// Tunables of one [`ChatSyncStore`] instance.
///
/// [`ChatSyncStore`]: crate::store::ChatSyncStore
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Size of the live message window for the active conversation.
    /// Env: `HUDDLE_MESSAGE_WINDOW`
    pub message_window: usize,

    /// Whether inbound-message notifications are dispatched at all.
    /// Env: `HUDDLE_NOTIFICATIONS` (true/false)
    pub notifications_enabled: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_window: DEFAULT_MESSAGE_WINDOW,
            notifications_enabled: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HUDDLE_MESSAGE_WINDOW") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.message_window = n,
                _ => {
                    tracing::warn!(value = %val, "Invalid HUDDLE_MESSAGE_WINDOW, using default");
                }
            }
        }

        if let Ok(val) = std::env::var("HUDDLE_NOTIFICATIONS") {
            config.notifications_enabled = val != "false" && val != "0";
        }

        config
    }
}
