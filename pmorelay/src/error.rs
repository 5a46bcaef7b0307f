//! Error types for the relay session manager

use crate::model::GuildId;
use std::time::Duration;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the session manager and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The endpoint never reached `Ready` within the handshake timeout
    #[error("Connection timeout for guild {guild_id} after {timeout:?}")]
    ConnectionTimeout { guild_id: GuildId, timeout: Duration },

    /// Endpoint-level fault
    #[error("Transport error: {0}")]
    Transport(String),

    /// Resource acquisition or player fault
    #[error("Playback error: {0}")]
    Playback(String),

    /// Guild or channel no longer resolvable from the configuration store
    #[error("Stale configuration for guild {guild_id}: {reason}")]
    StaleConfiguration { guild_id: GuildId, reason: String },

    /// A session (or a pending join) already exists for the guild
    #[error("Guild {0} already has a session")]
    AlreadyConnected(GuildId),

    /// The join was cancelled by a leave issued during the handshake
    #[error("Join cancelled for guild {0}")]
    JoinCancelled(GuildId),

    /// Configuration store failure
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    /// The manager task has stopped
    #[error("Session manager is closed")]
    ManagerClosed,
}

impl RelayError {
    /// Create a transport error from a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a playback error from a message
    pub fn playback(msg: impl Into<String>) -> Self {
        Self::Playback(msg.into())
    }

    /// Whether the error is a handshake timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout { .. })
    }
}
