//! Default timings of the relay supervisor.
//!
//! These values come from running the relay against real voice gateways and a
//! flaky upstream radio feed. All of them can be overridden through
//! [`RelayConfig`](crate::config::RelayConfig).

use std::time::Duration;

// ============================================================================
// Connection
// ============================================================================

/// Handshake timeout when joining (seconds)
///
/// Voice handshakes can be slow under load; a join fails with
/// `ConnectionTimeout` only after this delay.
///
/// Value: 60 seconds
pub const READY_TIMEOUT_SECONDS: u64 = 60;

/// Self-heal window after a disconnect (seconds)
///
/// After `Disconnected`, the endpoint gets this long to go back to
/// `Signalling` or `Connecting` by itself before the connection is declared
/// lost.
///
/// Value: 5 seconds
pub const SELF_HEAL_WINDOW_SECONDS: u64 = 5;

/// Cooldown before rejoining a lost connection (seconds)
///
/// Must stay longer than the self-heal window so the endpoint's own
/// reconnection is never raced.
///
/// Value: 10 seconds
pub const REJOIN_COOLDOWN_SECONDS: u64 = 10;

// ============================================================================
// Playback
// ============================================================================

/// Grace delay after stopping a non-idle player before a new start (ms)
///
/// Value: 1000 ms
pub const STOP_GRACE_MS: u64 = 1000;

/// Time a start stays "in flight" after the resource was attached (ms)
///
/// Absorbs the provider's own fallback retries without double-starting.
///
/// Value: 2000 ms
pub const START_SETTLE_MS: u64 = 2000;

/// Wait before acting on a spontaneous idle (seconds)
///
/// Short gaps in the upstream feed resolve themselves within this delay.
///
/// Value: 10 seconds
pub const IDLE_RESTART_DELAY_SECONDS: u64 = 10;

/// Delay before restarting after a player error (seconds)
///
/// Value: 5 seconds
pub const ERROR_RESTART_DELAY_SECONDS: u64 = 5;

/// Initial delay before retrying a failed start (seconds)
///
/// Value: 8 seconds
pub const START_RETRY_INITIAL_SECONDS: u64 = 8;

/// Multiplier applied to the start retry delay after each failure
///
/// 1.0 keeps a constant delay: retries never stop and never slow down.
///
/// Value: 1.0
pub const START_RETRY_MULTIPLIER: f32 = 1.0;

/// Upper bound of the start retry delay (seconds)
///
/// Value: 120 seconds
pub const START_RETRY_MAX_SECONDS: u64 = 120;

// ============================================================================
// Reconnection sweep
// ============================================================================

/// Spacing between two join attempts of a sweep (ms)
///
/// Value: 2000 ms
pub const SWEEP_SPACING_MS: u64 = 2000;

/// Delay before retrying a join that failed during a sweep (seconds)
///
/// Value: 30 seconds
pub const SWEEP_RETRY_DELAY_SECONDS: u64 = 30;

/// Pause between "leave all" and "reconnect all" of a full restart (ms)
///
/// Value: 2000 ms
pub const RESTART_ALL_PAUSE_MS: u64 = 2000;

// ============================================================================
// Actor
// ============================================================================

/// Capacity of the manager command channel
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Helper to get the handshake timeout as Duration
pub fn ready_timeout() -> Duration {
    Duration::from_secs(READY_TIMEOUT_SECONDS)
}

/// Helper to get the self-heal window as Duration
pub fn self_heal_window() -> Duration {
    Duration::from_secs(SELF_HEAL_WINDOW_SECONDS)
}

/// Helper to get the rejoin cooldown as Duration
pub fn rejoin_cooldown() -> Duration {
    Duration::from_secs(REJOIN_COOLDOWN_SECONDS)
}
