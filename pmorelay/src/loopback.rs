//! In-process transport.
//!
//! `LoopbackGateway` resolves guilds and channels from an in-memory registry
//! and hands out endpoints whose state is driven by hand (or by a scripted
//! handshake). `LoopbackPlayer` drains the attached byte stream and goes idle
//! when it ends. Used by the test suite and for dry runs without a voice
//! network.

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::model::{
    ChannelDescriptor, ChannelId, ConnectionState, GuildId, GuildInfo, PlaybackStatus,
};
use crate::resource::{AudioResource, VolumeHandle};
use crate::transport::{EndpointEvent, PlaybackHandle, PlayerEvent, VoiceEndpoint, VoiceGateway};

const EVENT_CAPACITY: usize = 64;

/// How a new endpoint reaches `Ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Immediate,
    Delayed(Duration),
    /// Stays in `Signalling` until driven by hand.
    Never,
    /// `connect` itself fails.
    Fail(String),
}

/// One call to `VoiceGateway::connect`.
#[derive(Debug, Clone)]
pub struct ConnectAttempt {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub at: Instant,
}

#[derive(Default)]
struct GatewayInner {
    guilds: HashMap<GuildId, String>,
    channels: HashMap<(GuildId, ChannelId), String>,
    handshakes: HashMap<GuildId, Handshake>,
    subscribe_faults: HashMap<GuildId, ConnectionState>,
    endpoints: HashMap<GuildId, Vec<Arc<LoopbackEndpoint>>>,
    players: Vec<Arc<LoopbackPlayer>>,
    attempts: Vec<ConnectAttempt>,
}

pub struct LoopbackGateway {
    inner: Mutex<GatewayInner>,
    default_handshake: Handshake,
}

impl Default for LoopbackGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackGateway {
    pub fn new() -> Self {
        Self::with_handshake(Handshake::Immediate)
    }

    pub fn with_handshake(default_handshake: Handshake) -> Self {
        Self {
            inner: Mutex::new(GatewayInner::default()),
            default_handshake,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GatewayInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_guild(&self, guild_id: impl Into<GuildId>, name: impl Into<String>) {
        self.lock().guilds.insert(guild_id.into(), name.into());
    }

    pub fn remove_guild(&self, guild_id: &GuildId) {
        let mut inner = self.lock();
        inner.guilds.remove(guild_id);
        inner.channels.retain(|(guild, _), _| guild != guild_id);
    }

    pub fn add_channel(
        &self,
        guild_id: impl Into<GuildId>,
        channel_id: impl Into<ChannelId>,
        name: impl Into<String>,
    ) {
        self.lock()
            .channels
            .insert((guild_id.into(), channel_id.into()), name.into());
    }

    pub fn remove_channel(&self, guild_id: &GuildId, channel_id: &ChannelId) {
        self.lock()
            .channels
            .remove(&(guild_id.clone(), channel_id.clone()));
    }

    /// Override the handshake of future endpoints for one guild.
    pub fn set_handshake(&self, guild_id: impl Into<GuildId>, handshake: Handshake) {
        self.lock().handshakes.insert(guild_id.into(), handshake);
    }

    /// Make the guild's next endpoint move to `state` as soon as a player
    /// subscribes to it, as a link dropping right after the handshake would.
    pub fn fault_on_subscribe(&self, guild_id: impl Into<GuildId>, state: ConnectionState) {
        self.lock().subscribe_faults.insert(guild_id.into(), state);
    }

    pub fn connect_attempts(&self) -> Vec<ConnectAttempt> {
        self.lock().attempts.clone()
    }

    /// Most recent endpoint created for the guild, whatever its state.
    pub fn endpoint(&self, guild_id: &GuildId) -> Option<Arc<LoopbackEndpoint>> {
        self.lock()
            .endpoints
            .get(guild_id)
            .and_then(|list| list.last().cloned())
    }

    pub fn endpoints(&self, guild_id: &GuildId) -> Vec<Arc<LoopbackEndpoint>> {
        self.lock()
            .endpoints
            .get(guild_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Player bound to the guild's most recent endpoint.
    pub fn player(&self, guild_id: &GuildId) -> Option<Arc<LoopbackPlayer>> {
        let bound = self.endpoint(guild_id)?.player()?;
        let bound_ptr = Arc::as_ptr(&bound) as *const ();
        self.lock()
            .players
            .iter()
            .find(|player| Arc::as_ptr(player) as *const () == bound_ptr)
            .cloned()
    }

    /// Register an endpoint the relay did not create.
    pub fn inject_endpoint(&self, channel: &ChannelDescriptor) -> Arc<LoopbackEndpoint> {
        let endpoint = LoopbackEndpoint::new(channel.guild_id.clone(), channel.channel_id.clone());
        endpoint.set_state(ConnectionState::Ready);
        self.lock()
            .endpoints
            .entry(channel.guild_id.clone())
            .or_default()
            .push(Arc::clone(&endpoint));
        endpoint
    }
}

#[async_trait]
impl VoiceGateway for LoopbackGateway {
    fn guild(&self, guild_id: &GuildId) -> Option<GuildInfo> {
        self.lock().guilds.get(guild_id).map(|name| GuildInfo {
            id: guild_id.clone(),
            name: name.clone(),
        })
    }

    fn channel(&self, guild_id: &GuildId, channel_id: &ChannelId) -> Option<ChannelDescriptor> {
        let inner = self.lock();
        let guild_name = inner.guilds.get(guild_id)?;
        let channel_name = inner.channels.get(&(guild_id.clone(), channel_id.clone()))?;
        Some(ChannelDescriptor {
            guild_id: guild_id.clone(),
            channel_id: channel_id.clone(),
            guild_name: guild_name.clone(),
            channel_name: channel_name.clone(),
        })
    }

    async fn connect(&self, channel: &ChannelDescriptor) -> Result<Arc<dyn VoiceEndpoint>> {
        let (endpoint, handshake) = {
            let mut inner = self.lock();
            inner.attempts.push(ConnectAttempt {
                guild_id: channel.guild_id.clone(),
                channel_id: channel.channel_id.clone(),
                at: Instant::now(),
            });
            let handshake = inner
                .handshakes
                .get(&channel.guild_id)
                .cloned()
                .unwrap_or_else(|| self.default_handshake.clone());
            if let Handshake::Fail(message) = &handshake {
                return Err(RelayError::transport(message.clone()));
            }
            let endpoint =
                LoopbackEndpoint::new(channel.guild_id.clone(), channel.channel_id.clone());
            if let Some(fault) = inner.subscribe_faults.remove(&channel.guild_id) {
                *endpoint.subscribe_fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(fault);
            }
            inner
                .endpoints
                .entry(channel.guild_id.clone())
                .or_default()
                .push(Arc::clone(&endpoint));
            (endpoint, handshake)
        };

        match handshake {
            Handshake::Immediate => endpoint.complete_handshake(),
            Handshake::Delayed(delay) => {
                let pending = Arc::clone(&endpoint);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    pending.complete_handshake();
                });
            }
            Handshake::Never | Handshake::Fail(_) => {}
        }

        Ok(endpoint)
    }

    fn create_player(&self) -> Arc<dyn PlaybackHandle> {
        let player = LoopbackPlayer::new();
        self.lock().players.push(Arc::clone(&player));
        player
    }

    fn existing_endpoint(&self, guild_id: &GuildId) -> Option<Arc<dyn VoiceEndpoint>> {
        self.lock()
            .endpoints
            .get(guild_id)
            .and_then(|list| {
                list.iter()
                    .rev()
                    .find(|endpoint| !endpoint.state().is_terminal())
                    .cloned()
            })
            .map(|endpoint| endpoint as Arc<dyn VoiceEndpoint>)
    }
}

pub struct LoopbackEndpoint {
    guild_id: GuildId,
    channel_id: ChannelId,
    state: Mutex<ConnectionState>,
    events: broadcast::Sender<EndpointEvent>,
    player: Mutex<Option<Arc<dyn PlaybackHandle>>>,
    subscribe_fault: Mutex<Option<ConnectionState>>,
    destroy_calls: AtomicUsize,
}

impl LoopbackEndpoint {
    pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            channel_id,
            state: Mutex::new(ConnectionState::Signalling),
            events: broadcast::channel(EVENT_CAPACITY).0,
            player: Mutex::new(None),
            subscribe_fault: Mutex::new(None),
            destroy_calls: AtomicUsize::new(0),
        })
    }

    /// Move to `new`, publishing the transition if the state changed.
    pub fn set_state(&self, new: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let old = std::mem::replace(&mut *state, new);
        if old != new {
            debug!(guild = %self.guild_id, %old, %new, "Loopback endpoint transition");
            let _ = self.events.send(EndpointEvent::StateChange { old, new });
        }
    }

    pub fn emit_error(&self, message: impl Into<String>) {
        let _ = self.events.send(EndpointEvent::Error(message.into()));
    }

    fn complete_handshake(&self) {
        if self.state() == ConnectionState::Signalling {
            self.set_state(ConnectionState::Connecting);
            self.set_state(ConnectionState::Ready);
        }
    }

    pub fn player(&self) -> Option<Arc<dyn PlaybackHandle>> {
        self.player.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// How many times `destroy` succeeded.
    pub fn destroy_count(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

impl VoiceEndpoint for LoopbackEndpoint {
    fn guild_id(&self) -> &GuildId {
        &self.guild_id
    }

    fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn events(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    fn subscribe(&self, player: Arc<dyn PlaybackHandle>) -> Result<()> {
        if self.state().is_terminal() {
            return Err(RelayError::transport("endpoint destroyed"));
        }
        *self.player.lock().unwrap_or_else(|p| p.into_inner()) = Some(player);
        let fault = self
            .subscribe_fault
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(state) = fault {
            self.set_state(state);
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Err(RelayError::transport("endpoint already destroyed"));
        }
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let player = self.player.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(player) = player {
            player.stop();
        }
        self.set_state(ConnectionState::Destroyed);
        Ok(())
    }
}

struct PlayerInner {
    status: PlaybackStatus,
    volume: Option<VolumeHandle>,
    drain: Option<AbortHandle>,
    generation: u64,
    titles: Vec<String>,
}

pub struct LoopbackPlayer {
    me: Weak<LoopbackPlayer>,
    inner: Mutex<PlayerInner>,
    events: broadcast::Sender<PlayerEvent>,
    bytes: AtomicU64,
}

impl LoopbackPlayer {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            inner: Mutex::new(PlayerInner {
                status: PlaybackStatus::Idle,
                volume: None,
                drain: None,
                generation: 0,
                titles: Vec::new(),
            }),
            events: broadcast::channel(EVENT_CAPACITY).0,
            bytes: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlayerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(inner: &mut PlayerInner, events: &broadcast::Sender<PlayerEvent>, new: PlaybackStatus) {
        let old = std::mem::replace(&mut inner.status, new);
        if old != new {
            let _ = events.send(PlayerEvent::StateChange { old, new });
        }
    }

    /// Force a status, as the sink would report it.
    pub fn set_status(&self, new: PlaybackStatus) {
        let mut inner = self.lock();
        Self::transition(&mut inner, &self.events, new);
    }

    pub fn emit_error(&self, message: impl Into<String>) {
        let _ = self.events.send(PlayerEvent::Error(message.into()));
    }

    /// Number of resources attached so far.
    pub fn play_count(&self) -> usize {
        self.lock().titles.len()
    }

    pub fn titles(&self) -> Vec<String> {
        self.lock().titles.clone()
    }

    pub fn bytes_played(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn stream_ended(&self, generation: u64, error: Option<String>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.drain = None;
        inner.volume = None;
        if let Some(message) = error {
            let _ = self.events.send(PlayerEvent::Error(message));
        }
        Self::transition(&mut inner, &self.events, PlaybackStatus::Idle);
    }
}

impl PlaybackHandle for LoopbackPlayer {
    fn status(&self) -> PlaybackStatus {
        self.lock().status
    }

    fn events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    fn play(&self, resource: AudioResource) -> Result<()> {
        let title = resource.title().to_string();
        let (volume, mut stream) = resource.into_parts();

        let mut inner = self.lock();
        if let Some(previous) = inner.drain.take() {
            previous.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.volume = volume;
        inner.titles.push(title);

        let me = self.me.clone();
        let drain = tokio::spawn(async move {
            let mut error = None;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if let Some(player) = me.upgrade() {
                            player.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        }
                    }
                    Err(err) => {
                        error = Some(err.to_string());
                        break;
                    }
                }
            }
            if let Some(player) = me.upgrade() {
                player.stream_ended(generation, error);
            }
        });
        inner.drain = Some(drain.abort_handle());

        Self::transition(&mut inner, &self.events, PlaybackStatus::Playing);
        Ok(())
    }

    fn stop(&self) -> bool {
        let mut inner = self.lock();
        if inner.status.is_idle() {
            return false;
        }
        inner.generation += 1;
        if let Some(drain) = inner.drain.take() {
            drain.abort();
        }
        inner.volume = None;
        Self::transition(&mut inner, &self.events, PlaybackStatus::Idle);
        true
    }

    fn unpause(&self) -> bool {
        let mut inner = self.lock();
        if !matches!(
            inner.status,
            PlaybackStatus::Paused | PlaybackStatus::AutoPaused
        ) {
            return false;
        }
        Self::transition(&mut inner, &self.events, PlaybackStatus::Playing);
        true
    }

    fn volume(&self) -> Option<VolumeHandle> {
        self.lock().volume.clone()
    }
}
