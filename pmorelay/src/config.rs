//! Configuration structures for the relay supervisor.
//!
//! The YAML subtree lives under `relay` in the pmoconfig file. Every field
//! has a default taken from [`constants`](crate::constants), so a missing or
//! partial section still yields a complete configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::*;

/// Top-level configuration block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl RelayConfig {
    /// Read the `relay` subtree from a configuration manager.
    pub fn from_config(config: &pmoconfig::Config) -> Self {
        config.get_section(&["relay"])
    }

    pub fn load_from_pmoconfig() -> anyhow::Result<Self> {
        let cfg = pmoconfig::get_config();
        Ok(Self::from_config(&cfg))
    }
}

/// Endpoint handshake and recovery tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "ConnectionConfig::default_ready_timeout")]
    pub ready_timeout_seconds: u64,
    #[serde(default = "ConnectionConfig::default_self_heal_window")]
    pub self_heal_window_seconds: u64,
    #[serde(default = "ConnectionConfig::default_rejoin_cooldown")]
    pub rejoin_cooldown_seconds: u64,
}

impl ConnectionConfig {
    const fn default_ready_timeout() -> u64 {
        READY_TIMEOUT_SECONDS
    }

    const fn default_self_heal_window() -> u64 {
        SELF_HEAL_WINDOW_SECONDS
    }

    const fn default_rejoin_cooldown() -> u64 {
        REJOIN_COOLDOWN_SECONDS
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_seconds)
    }

    pub fn self_heal_window(&self) -> Duration {
        Duration::from_secs(self.self_heal_window_seconds)
    }

    pub fn rejoin_cooldown(&self) -> Duration {
        Duration::from_secs(self.rejoin_cooldown_seconds)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ready_timeout_seconds: Self::default_ready_timeout(),
            self_heal_window_seconds: Self::default_self_heal_window(),
            rejoin_cooldown_seconds: Self::default_rejoin_cooldown(),
        }
    }
}

/// Playback start and restart tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "PlaybackConfig::default_stop_grace")]
    pub stop_grace_ms: u64,
    #[serde(default = "PlaybackConfig::default_start_settle")]
    pub start_settle_ms: u64,
    #[serde(default = "PlaybackConfig::default_idle_restart")]
    pub idle_restart_delay_seconds: u64,
    #[serde(default = "PlaybackConfig::default_error_restart")]
    pub error_restart_delay_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl PlaybackConfig {
    const fn default_stop_grace() -> u64 {
        STOP_GRACE_MS
    }

    const fn default_start_settle() -> u64 {
        START_SETTLE_MS
    }

    const fn default_idle_restart() -> u64 {
        IDLE_RESTART_DELAY_SECONDS
    }

    const fn default_error_restart() -> u64 {
        ERROR_RESTART_DELAY_SECONDS
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn idle_restart_delay(&self) -> Duration {
        Duration::from_secs(self.idle_restart_delay_seconds)
    }

    pub fn error_restart_delay(&self) -> Duration {
        Duration::from_secs(self.error_restart_delay_seconds)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: Self::default_stop_grace(),
            start_settle_ms: Self::default_start_settle(),
            idle_restart_delay_seconds: Self::default_idle_restart(),
            error_restart_delay_seconds: Self::default_error_restart(),
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff applied between failed playback starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_initial")]
    pub initial_seconds: u64,
    #[serde(default = "RetryConfig::default_multiplier")]
    pub multiplier: f32,
    #[serde(default = "RetryConfig::default_max")]
    pub max_seconds: u64,
}

impl RetryConfig {
    const fn default_initial() -> u64 {
        START_RETRY_INITIAL_SECONDS
    }

    const fn default_multiplier() -> f32 {
        START_RETRY_MULTIPLIER
    }

    const fn default_max() -> u64 {
        START_RETRY_MAX_SECONDS
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_seconds: Self::default_initial(),
            multiplier: Self::default_multiplier(),
            max_seconds: Self::default_max(),
        }
    }
}

/// Reconnection sweep tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "SweepConfig::default_spacing")]
    pub spacing_ms: u64,
    #[serde(default = "SweepConfig::default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "SweepConfig::default_restart_pause")]
    pub restart_pause_ms: u64,
}

impl SweepConfig {
    const fn default_spacing() -> u64 {
        SWEEP_SPACING_MS
    }

    const fn default_retry_delay() -> u64 {
        SWEEP_RETRY_DELAY_SECONDS
    }

    const fn default_restart_pause() -> u64 {
        RESTART_ALL_PAUSE_MS
    }

    pub fn spacing(&self) -> Duration {
        Duration::from_millis(self.spacing_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            spacing_ms: Self::default_spacing(),
            retry_delay_seconds: Self::default_retry_delay(),
            restart_pause_ms: Self::default_restart_pause(),
        }
    }
}
