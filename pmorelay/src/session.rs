//! Per-guild session bookkeeping and the playback phase machine.
//!
//! A [`GuildSession`] is owned by the manager task and never shared. The
//! [`PlaybackPhase`] enum is the only guard against concurrent starts and
//! duplicate restarts: every transition goes through the methods below and
//! returns a [`Reaction`] the manager turns into side effects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::model::{ChannelDescriptor, GuildId, PlaybackStatus, SessionSnapshot, SessionSummary};
use crate::transport::{PlaybackHandle, VoiceEndpoint};

/// Manager-side view of a session's playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackPhase {
    /// Nothing attached and no start in flight.
    Idle,
    /// A start is in flight (stop, acquire, play, settle).
    Starting,
    Playing,
    /// The player went idle on its own; a re-check is armed.
    RestartPending,
    AutoPaused,
}

/// Side effect requested by a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    None,
    /// Re-check the player after the idle restart delay.
    ArmIdleCheck,
    Unpause,
    /// Playback went through: reset the retry backoff.
    Recovered,
    /// The start failed: schedule a retry.
    ScheduleRetry,
}

impl PlaybackPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Playing => "playing",
            Self::RestartPending => "restart-pending",
            Self::AutoPaused => "autopaused",
        }
    }

    /// Phase matching a player status once no start is in flight.
    pub const fn settled(status: PlaybackStatus) -> Self {
        match status {
            PlaybackStatus::Idle => Self::Idle,
            PlaybackStatus::AutoPaused => Self::AutoPaused,
            PlaybackStatus::Buffering | PlaybackStatus::Playing | PlaybackStatus::Paused => {
                Self::Playing
            }
        }
    }

    /// Enter `Starting`. Returns `false` if a start is already in flight.
    pub fn try_start(&mut self) -> bool {
        if *self == Self::Starting {
            return false;
        }
        *self = Self::Starting;
        true
    }

    /// Apply a status reported by the player.
    pub fn on_status(&mut self, status: PlaybackStatus) -> Reaction {
        match (*self, status) {
            // Our own stop emits Idle while starting; the start settles the phase.
            (Self::Starting, PlaybackStatus::Playing) => Reaction::Recovered,
            (Self::Starting, PlaybackStatus::AutoPaused) => Reaction::Unpause,
            (Self::Starting, _) => Reaction::None,
            (_, PlaybackStatus::Playing) => {
                *self = Self::Playing;
                Reaction::Recovered
            }
            (_, PlaybackStatus::AutoPaused) => {
                *self = Self::AutoPaused;
                Reaction::Unpause
            }
            (Self::Playing | Self::AutoPaused, PlaybackStatus::Idle) => {
                *self = Self::RestartPending;
                Reaction::ArmIdleCheck
            }
            _ => Reaction::None,
        }
    }

    /// Leave `Starting` once the start task reported back.
    pub fn finish_start(&mut self, succeeded: bool, status: PlaybackStatus) -> Reaction {
        if *self != Self::Starting {
            return Reaction::None;
        }
        if !succeeded {
            *self = Self::Idle;
            return Reaction::ScheduleRetry;
        }
        match status {
            PlaybackStatus::Idle => {
                *self = Self::RestartPending;
                Reaction::ArmIdleCheck
            }
            PlaybackStatus::AutoPaused => {
                *self = Self::AutoPaused;
                Reaction::Unpause
            }
            other => {
                *self = Self::settled(other);
                Reaction::Recovered
            }
        }
    }

    /// Idle re-check. Returns `true` when the player is still idle and a
    /// start must be issued; a recovered player settles the phase instead.
    pub fn idle_check(&mut self, status: PlaybackStatus) -> bool {
        if *self != Self::RestartPending {
            return false;
        }
        if status.is_idle() {
            return true;
        }
        *self = Self::settled(status);
        false
    }
}

impl fmt::Display for PlaybackPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay between failed starts: `initial × multiplier^n`, capped.
#[derive(Debug, Clone)]
pub struct BackoffState {
    initial: Duration,
    multiplier: f32,
    max: Duration,
    current: Option<Duration>,
    failures: u32,
}

impl BackoffState {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_secs(config.initial_seconds),
            multiplier: config.multiplier.max(1.0),
            max: Duration::from_secs(config.max_seconds.max(config.initial_seconds)),
            current: None,
            failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.failures = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            Some(current) => current.mul_f32(self.multiplier).min(self.max),
            None => self.initial,
        };
        self.current = Some(next);
        self.failures = self.failures.saturating_add(1);
        next
    }

    /// Failed starts since the last successful one.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Live pairing of one guild with its endpoint and player.
pub struct GuildSession {
    pub id: u64,
    pub channel: ChannelDescriptor,
    pub endpoint: Arc<dyn VoiceEndpoint>,
    pub player: Arc<dyn PlaybackHandle>,
    pub phase: PlaybackPhase,
    pub backoff: BackoffState,
    pub connected_at: Instant,
    starts: u64,
    tasks: Vec<AbortHandle>,
    start_task: Option<AbortHandle>,
}

impl GuildSession {
    pub fn new(
        id: u64,
        channel: ChannelDescriptor,
        endpoint: Arc<dyn VoiceEndpoint>,
        player: Arc<dyn PlaybackHandle>,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            id,
            channel,
            endpoint,
            player,
            phase: PlaybackPhase::Idle,
            backoff: BackoffState::new(retry),
            connected_at: Instant::now(),
            starts: 0,
            tasks: Vec::new(),
            start_task: None,
        }
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.channel.guild_id
    }

    /// Keep a background task (event forwarder) tied to the session lifetime.
    pub fn track(&mut self, task: AbortHandle) {
        self.tasks.push(task);
    }

    pub fn record_start(&mut self, task: AbortHandle) {
        self.starts += 1;
        if let Some(previous) = self.start_task.replace(task) {
            previous.abort();
        }
    }

    /// Starts issued after the first one.
    pub fn restarts(&self) -> u64 {
        self.starts.saturating_sub(1)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.endpoint.state(),
            playback: self.player.status(),
            phase: self.phase,
            channel_id: self.channel.channel_id.clone(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            guild_id: self.channel.guild_id.clone(),
            guild_name: self.channel.guild_name.clone(),
            channel_id: self.channel.channel_id.clone(),
            channel_name: self.channel.channel_name.clone(),
            connection: self.endpoint.state(),
            playback: self.player.status(),
            phase: self.phase,
            connected_for: self.connected_at.elapsed(),
            restarts: self.restarts(),
            consecutive_failures: self.backoff.failures(),
        }
    }
}

impl Drop for GuildSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.start_task.take() {
            task.abort();
        }
    }
}
