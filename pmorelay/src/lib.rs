//! # pmorelay - Supervisor for per-guild audio relay sessions
//!
//! This crate keeps a fleet of long-lived relay sessions alive: one session
//! per guild, each pulling audio from a shared upstream source and pushing it
//! to a real-time voice endpoint.
//!
//! ## Overview
//!
//! - [`SessionManager`]: single owner task for every session; join, leave,
//!   reconnection sweep, volume and status
//! - [`GuildSession`] / [`PlaybackPhase`]: per-session state and the playback
//!   phase machine guarding starts and restarts
//! - [`transport`]: gateway, endpoint and player seams
//! - [`ResourceProvider`]: upstream audio seam
//! - [`ChannelStore`]: which channel each guild wants the relay in
//! - [`loopback`]: in-process transport for tests and dry runs
//!
//! ## Recovery
//!
//! A disconnected endpoint gets a short window to start reconnecting on its
//! own. Past that window the session is torn down and a fresh join is
//! scheduled after a longer cooldown. On the playback side, a spontaneous idle
//! is re-checked after a delay, player errors trigger a delayed restart and
//! failed starts are retried with a per-session backoff.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pmorelay::{loopback::LoopbackGateway, MemoryChannelStore, RelayConfig, SessionManager};
//! # use pmorelay::{AudioResource, ResourceProvider};
//! # struct Silence;
//! # #[async_trait::async_trait]
//! # impl ResourceProvider for Silence {
//! #     async fn acquire(&self) -> pmorelay::Result<AudioResource> {
//! #         Ok(AudioResource::from_bytes("silence", vec![0u8; 64]))
//! #     }
//! # }
//!
//! # async fn example() -> pmorelay::Result<()> {
//! let manager = SessionManager::spawn(
//!     Arc::new(LoopbackGateway::new()),
//!     Arc::new(Silence),
//!     Arc::new(MemoryChannelStore::new()),
//!     RelayConfig::default(),
//! );
//!
//! let report = manager.reconnect_all().await?;
//! println!("{} sessions joined", report.joined.len());
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logs;
pub mod loopback;
pub mod manager;
pub mod model;
pub mod resource;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{ConnectionConfig, PlaybackConfig, RelayConfig, RetryConfig, SweepConfig};
pub use error::{RelayError, Result};
pub use logs::{init_logging, LogHandle};
pub use manager::{SessionManager, SweepReport};
pub use model::{
    ChannelDescriptor, ChannelId, ConnectionState, GuildId, GuildInfo, ManagerStats,
    PlaybackStatus, SessionSnapshot, SessionStatus, SessionSummary,
};
pub use resource::{AudioByteStream, AudioResource, ResourceProvider, VolumeHandle};
pub use session::{BackoffState, GuildSession, PlaybackPhase, Reaction};
pub use store::{ChannelStore, MemoryChannelStore, NewStreamingChannel, StreamingChannel};
pub use transport::{
    wait_for_any_state, wait_for_state, EndpointEvent, PlaybackHandle, PlayerEvent,
    VoiceEndpoint, VoiceGateway,
};
