//! Identifiers, transport states and status snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::session::PlaybackPhase;

/// Stable external key of a guild (group).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuildId(String);

impl GuildId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GuildId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for GuildId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of a voice channel inside a guild.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A guild as resolved by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildInfo {
    pub id: GuildId,
    pub name: String,
}

/// A live voice channel, resolved at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub guild_name: String,
    pub channel_name: String,
}

/// Connection state of a transport endpoint.
///
/// `Signalling → Connecting → Ready`, `Ready → Disconnected`, then either a
/// return to `Signalling`/`Connecting` or an explicit destroy (`Destroyed`,
/// terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Signalling,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Signalling => "signalling",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Destroyed => "destroyed",
        }
    }

    /// The endpoint is working on a (re)connection by itself.
    pub const fn is_reconnecting(self) -> bool {
        matches!(self, Self::Signalling | Self::Connecting)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by a playback handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Idle,
    Buffering,
    Playing,
    Paused,
    /// The sink has no audience and paused on its own.
    AutoPaused,
}

impl PlaybackStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::AutoPaused => "autopaused",
        }
    }

    pub const fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub playback: PlaybackStatus,
    pub phase: PlaybackPhase,
    pub channel_id: ChannelId,
}

/// Answer of `get_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    NotConnected,
    Connected(SessionSnapshot),
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        match self {
            Self::Connected(snapshot) => Some(snapshot),
            Self::NotConnected => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => f.write_str("not connected"),
            Self::Connected(s) => write!(
                f,
                "{} / {} in channel {}",
                s.connection, s.playback, s.channel_id
            ),
        }
    }
}

/// Per-session line of `ManagerStats`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub guild_id: GuildId,
    pub guild_name: String,
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub connection: ConnectionState,
    pub playback: PlaybackStatus,
    pub phase: PlaybackPhase,
    pub connected_for: Duration,
    pub restarts: u64,
    pub consecutive_failures: u32,
}

/// Fleet-wide introspection.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub configured_channels: usize,
    pub active_sessions: usize,
    pub sessions: Vec<SessionSummary>,
}
