//! Transport seam: gateway, endpoints and playback handles.
//!
//! The manager never talks to a voice protocol directly. A [`VoiceGateway`]
//! resolves guilds and channels and opens [`VoiceEndpoint`]s; each endpoint
//! accepts one [`PlaybackHandle`]. Both endpoints and players publish their
//! transitions on a broadcast channel, in emission order.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::Result;
use crate::model::{
    ChannelDescriptor, ChannelId, ConnectionState, GuildId, GuildInfo, PlaybackStatus,
};
use crate::resource::{AudioResource, VolumeHandle};

/// Notification published by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    StateChange {
        old: ConnectionState,
        new: ConnectionState,
    },
    Error(String),
}

/// Notification published by a playback handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    StateChange {
        old: PlaybackStatus,
        new: PlaybackStatus,
    },
    Error(String),
}

/// One outbound real-time connection.
pub trait VoiceEndpoint: Send + Sync {
    fn guild_id(&self) -> &GuildId;

    fn channel_id(&self) -> &ChannelId;

    fn state(&self) -> ConnectionState;

    /// Subscribe to transitions and transport errors.
    fn events(&self) -> broadcast::Receiver<EndpointEvent>;

    /// Bind a playback handle to this endpoint.
    fn subscribe(&self, player: Arc<dyn PlaybackHandle>) -> Result<()>;

    /// Tear the connection down; the endpoint ends in `Destroyed`.
    fn destroy(&self) -> Result<()>;
}

/// Controller attaching resources to an endpoint.
pub trait PlaybackHandle: Send + Sync {
    fn status(&self) -> PlaybackStatus;

    fn events(&self) -> broadcast::Receiver<PlayerEvent>;

    /// Replace whatever is playing with `resource`.
    fn play(&self, resource: AudioResource) -> Result<()>;

    /// Returns `false` if there was nothing to stop.
    fn stop(&self) -> bool;

    /// Returns `false` if the player was not paused.
    fn unpause(&self) -> bool;

    /// Volume control of the resource currently attached, if it has one.
    fn volume(&self) -> Option<VolumeHandle>;
}

/// Access to guilds, channels and the endpoint factory.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    fn guild(&self, guild_id: &GuildId) -> Option<GuildInfo>;

    fn channel(&self, guild_id: &GuildId, channel_id: &ChannelId) -> Option<ChannelDescriptor>;

    /// Open a new endpoint towards `channel`. The endpoint starts signalling
    /// immediately; readiness is observed through its events.
    async fn connect(&self, channel: &ChannelDescriptor) -> Result<Arc<dyn VoiceEndpoint>>;

    fn create_player(&self) -> Arc<dyn PlaybackHandle>;

    /// Endpoint the gateway still tracks for `guild_id`, whoever created it.
    fn existing_endpoint(&self, guild_id: &GuildId) -> Option<Arc<dyn VoiceEndpoint>>;
}

/// Wait until the endpoint enters `target`, bounded by `timeout`.
///
/// Resolves immediately when the endpoint is already there. Returns `false`
/// on timeout or when the endpoint is destroyed first.
pub async fn wait_for_state<E>(endpoint: &E, target: ConnectionState, timeout: Duration) -> bool
where
    E: VoiceEndpoint + ?Sized,
{
    wait_for_any_state(endpoint, &[target], timeout).await
}

/// Race several `wait_for_state` calls sharing the same deadline.
pub async fn wait_for_any_state<E>(
    endpoint: &E,
    targets: &[ConnectionState],
    timeout: Duration,
) -> bool
where
    E: VoiceEndpoint + ?Sized,
{
    // Subscribe before reading the state so no transition slips in between.
    let mut events = endpoint.events();
    if targets.contains(&endpoint.state()) {
        return true;
    }
    let expects_destroyed = targets.contains(&ConnectionState::Destroyed);

    let wait = async {
        loop {
            match events.recv().await {
                Ok(EndpointEvent::StateChange { new, .. }) => {
                    if targets.contains(&new) {
                        return true;
                    }
                    if new.is_terminal() && !expects_destroyed {
                        return false;
                    }
                }
                Ok(EndpointEvent::Error(_)) => {}
                Err(RecvError::Lagged(_)) => {
                    if targets.contains(&endpoint.state()) {
                        return true;
                    }
                }
                Err(RecvError::Closed) => return targets.contains(&endpoint.state()),
            }
        }
    };

    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}
