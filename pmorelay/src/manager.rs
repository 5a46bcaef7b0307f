//! Session manager: one owner task for every guild session.
//!
//! [`SessionManager`] is a cheap cloneable handle. All session state lives in
//! a single task fed by an mpsc command channel, so callbacks, timers and
//! explicit operations never run concurrently against the same session.
//! Slow work (endpoint handshakes, resource acquisition, waits) runs in
//! spawned tasks that report back through the same channel, tagged with the
//! session id they were started for.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{PlaybackConfig, RelayConfig};
use crate::constants::COMMAND_CHANNEL_CAPACITY;
use crate::error::{RelayError, Result};
use crate::model::{
    ChannelDescriptor, ConnectionState, GuildId, ManagerStats, SessionStatus, SessionSummary,
};
use crate::resource::ResourceProvider;
use crate::session::{GuildSession, PlaybackPhase, Reaction};
use crate::store::{ChannelStore, StreamingChannel};
use crate::transport::{
    wait_for_any_state, wait_for_state, EndpointEvent, PlaybackHandle, PlayerEvent,
    VoiceEndpoint, VoiceGateway,
};

/// Outcome of a reconnection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub joined: Vec<GuildId>,
    /// A session or a join already existed.
    pub already_active: Vec<GuildId>,
    /// Entries deleted because their guild is gone.
    pub pruned: Vec<GuildId>,
    /// Entries left alone because their channel is gone.
    pub skipped: Vec<GuildId>,
    /// Joins that failed; each got one deferred retry.
    pub failed: Vec<GuildId>,
}

struct Shared {
    gateway: Arc<dyn VoiceGateway>,
    provider: Arc<dyn ResourceProvider>,
    store: Arc<dyn ChannelStore>,
    config: RelayConfig,
}

/// Handle to the session manager task.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

/// Handle that does not keep the manager alive; used by deferred work.
#[derive(Clone)]
struct WeakSessionManager {
    tx: mpsc::WeakSender<Command>,
    shared: Arc<Shared>,
}

impl WeakSessionManager {
    fn upgrade(&self) -> Option<SessionManager> {
        self.tx.upgrade().map(|tx| SessionManager {
            tx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Issue one `rejoin_session` after `delay`, unless the manager is gone.
    fn schedule_rejoin(&self, guild_id: GuildId, delay: Duration) {
        let weak = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if let Err(err) = manager.rejoin_session(&guild_id).await {
                warn!(guild = %guild_id, "Deferred rejoin failed: {}", err);
            }
        });
    }
}

enum Resolution {
    Channel(ChannelDescriptor),
    GuildGone,
    ChannelGone,
}

impl SessionManager {
    /// Start the manager task.
    pub fn spawn(
        gateway: Arc<dyn VoiceGateway>,
        provider: Arc<dyn ResourceProvider>,
        store: Arc<dyn ChannelStore>,
        config: RelayConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            gateway,
            provider,
            store,
            config,
        });

        let state = ManagerState::new(Arc::clone(&shared), tx.downgrade());
        tokio::spawn(state.run(rx));

        Self { tx, shared }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// `true` once the manager task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn downgrade(&self) -> WeakSessionManager {
        WeakSessionManager {
            tx: self.tx.downgrade(),
            shared: Arc::clone(&self.shared),
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| RelayError::ManagerClosed)?;
        response.await.map_err(|_| RelayError::ManagerClosed)
    }

    /// Connect to `channel` and start relaying once the endpoint is ready.
    ///
    /// Fails with `AlreadyConnected` when the guild has a session or a join
    /// in progress, `ConnectionTimeout` when the handshake does not complete,
    /// `JoinCancelled` when a leave was issued meanwhile. On failure no
    /// session and no endpoint are left behind.
    pub async fn join_session(&self, channel: ChannelDescriptor) -> Result<()> {
        let manager = self.clone();
        // The handshake outlives a dropped caller so its endpoint is always
        // either attached or destroyed.
        tokio::spawn(async move { manager.run_join(channel).await })
            .await
            .map_err(|err| RelayError::transport(format!("join task failed: {err}")))?
    }

    async fn run_join(&self, channel: ChannelDescriptor) -> Result<()> {
        let guild_id = channel.guild_id.clone();
        let ticket = self
            .request(|reply| Command::BeginJoin {
                guild_id: guild_id.clone(),
                reply,
            })
            .await??;

        info!(
            guild = %guild_id,
            channel = %channel.channel_id,
            session = ticket,
            "Joining {} / {}",
            channel.guild_name,
            channel.channel_name
        );

        let endpoint = match self.shared.gateway.connect(&channel).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.abort_join(&guild_id, ticket).await?;
                return Err(err);
            }
        };

        let timeout = self.shared.config.connection.ready_timeout();
        if !wait_for_state(endpoint.as_ref(), ConnectionState::Ready, timeout).await {
            let state = endpoint.state();
            destroy_quietly(endpoint.as_ref());
            if !self.abort_join(&guild_id, ticket).await? {
                return Err(RelayError::JoinCancelled(guild_id));
            }
            if state.is_terminal() {
                return Err(RelayError::transport(format!(
                    "endpoint for guild {guild_id} destroyed during handshake"
                )));
            }
            warn!(guild = %guild_id, "Endpoint not ready after {:?}", timeout);
            return Err(RelayError::ConnectionTimeout { guild_id, timeout });
        }

        let player = self.shared.gateway.create_player();
        if let Err(err) = endpoint.subscribe(Arc::clone(&player)) {
            destroy_quietly(endpoint.as_ref());
            self.abort_join(&guild_id, ticket).await?;
            return Err(err);
        }

        let attached = self
            .request(|reply| Command::Attach {
                ticket,
                channel,
                endpoint: Arc::clone(&endpoint),
                player,
                reply,
            })
            .await;

        match attached {
            Ok(result) => result,
            Err(err) => {
                destroy_quietly(endpoint.as_ref());
                Err(err)
            }
        }
    }

    /// Release a join reservation. Returns `false` if it had been cancelled.
    async fn abort_join(&self, guild_id: &GuildId, ticket: u64) -> Result<bool> {
        self.request(|reply| Command::AbortJoin {
            guild_id: guild_id.clone(),
            ticket,
            reply,
        })
        .await
    }

    /// Stop playback and tear the session down. Never fails; a no-op without
    /// a session. A join still handshaking for the guild is cancelled.
    pub async fn leave_session(&self, guild_id: &GuildId) {
        let result = self
            .request(|reply| Command::Leave {
                guild_id: guild_id.clone(),
                reply,
            })
            .await;
        if let Err(err) = result {
            debug!(guild = %guild_id, "Leave ignored: {}", err);
        }
    }

    /// Re-establish every configured session, spacing the join attempts.
    pub async fn reconnect_all(&self) -> Result<SweepReport> {
        let entries = self.shared.store.find_all().await?;
        let sweep = &self.shared.config.sweep;
        info!(count = entries.len(), "Reconnecting configured channels");

        let mut report = SweepReport::default();
        let mut last_attempt: Option<Instant> = None;

        for entry in entries {
            let guild_id = entry.guild_id.clone();
            let channel = match self.resolve(&entry) {
                Resolution::Channel(channel) => channel,
                Resolution::GuildGone => {
                    warn!("{}", stale(&entry, "guild no longer exists, entry deleted"));
                    if let Err(err) = self.shared.store.delete(&guild_id).await {
                        warn!(guild = %guild_id, "Failed to delete stale entry: {}", err);
                    }
                    report.pruned.push(guild_id);
                    continue;
                }
                Resolution::ChannelGone => {
                    warn!("{}", stale(&entry, "channel not found, skipping"));
                    report.skipped.push(guild_id);
                    continue;
                }
            };

            if let Some(previous) = last_attempt {
                sleep_until(previous + sweep.spacing()).await;
            }
            last_attempt = Some(Instant::now());

            match self.join_session(channel).await {
                Ok(()) => report.joined.push(guild_id),
                Err(RelayError::AlreadyConnected(_)) => report.already_active.push(guild_id),
                Err(RelayError::ManagerClosed) => return Err(RelayError::ManagerClosed),
                Err(err) => {
                    warn!(
                        guild = %guild_id,
                        "Join failed during sweep, retrying in {:?}: {}",
                        sweep.retry_delay(),
                        err
                    );
                    self.downgrade()
                        .schedule_rejoin(guild_id.clone(), sweep.retry_delay());
                    report.failed.push(guild_id);
                }
            }
        }

        info!(
            joined = report.joined.len(),
            pruned = report.pruned.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Reconnection sweep finished"
        );
        Ok(report)
    }

    /// Join again from the configuration store as it is now.
    ///
    /// Returns quietly when the entry, the guild or the channel no longer
    /// resolves, or when a session or a join already exists.
    pub async fn rejoin_session(&self, guild_id: &GuildId) -> Result<()> {
        let Some(entry) = self.shared.store.find_by_guild(guild_id).await? else {
            debug!(guild = %guild_id, "No configuration left, not rejoining");
            return Ok(());
        };

        let channel = match self.resolve(&entry) {
            Resolution::Channel(channel) => channel,
            Resolution::GuildGone | Resolution::ChannelGone => {
                debug!(guild = %guild_id, "Configuration no longer resolves, not rejoining");
                return Ok(());
            }
        };

        match self.join_session(channel).await {
            Err(RelayError::AlreadyConnected(_)) => {
                debug!(guild = %guild_id, "Already connected, rejoin skipped");
                Ok(())
            }
            other => other,
        }
    }

    fn resolve(&self, entry: &StreamingChannel) -> Resolution {
        let gateway = &self.shared.gateway;
        if gateway.guild(&entry.guild_id).is_none() {
            return Resolution::GuildGone;
        }
        match gateway.channel(&entry.guild_id, &entry.channel_id) {
            Some(channel) => Resolution::Channel(channel),
            None => Resolution::ChannelGone,
        }
    }

    /// Apply `level` (0..=100) to the current resource.
    ///
    /// Returns `false` when there is no session or the resource has no
    /// volume control.
    pub async fn set_volume(&self, guild_id: &GuildId, level: u8) -> bool {
        self.request(|reply| Command::SetVolume {
            guild_id: guild_id.clone(),
            level,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn get_status(&self, guild_id: &GuildId) -> SessionStatus {
        self.request(|reply| Command::Status {
            guild_id: guild_id.clone(),
            reply,
        })
        .await
        .unwrap_or(SessionStatus::NotConnected)
    }

    pub async fn list_active(&self) -> Vec<GuildId> {
        self.request(|reply| Command::ListActive { reply })
            .await
            .unwrap_or_default()
    }

    /// Request a fresh playback start. Returns `false` if there is no
    /// session or a start is already in flight.
    pub async fn restart_playback(&self, guild_id: &GuildId) -> bool {
        self.request(|reply| Command::RestartPlayback {
            guild_id: guild_id.clone(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Leave every live session. Returns how many were torn down.
    pub async fn leave_all(&self) -> usize {
        self.request(|reply| Command::LeaveAll { reply })
            .await
            .unwrap_or(0)
    }

    /// Leave everything, pause, then run a full reconnection sweep.
    pub async fn restart_all(&self) -> Result<SweepReport> {
        let left = self.leave_all().await;
        info!(left, "Restarting every session");
        sleep(self.shared.config.sweep.restart_pause()).await;
        self.reconnect_all().await
    }

    /// The relay was removed from a guild: leave and drop its configuration.
    pub async fn forget_guild(&self, guild_id: &GuildId) -> Result<bool> {
        self.leave_session(guild_id).await;
        let deleted = self.shared.store.delete(guild_id).await?;
        info!(guild = %guild_id, deleted, "Guild forgotten");
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        let configured_channels = self.shared.store.count().await?;
        let sessions = self.request(|reply| Command::Summaries { reply }).await?;
        Ok(ManagerStats {
            configured_channels,
            active_sessions: sessions.len(),
            sessions,
        })
    }

    /// Leave every session, stop the manager task and close the store.
    pub async fn shutdown(&self) -> Result<()> {
        let left = self.request(|reply| Command::Shutdown { reply }).await?;
        info!(left, "Session manager shut down");
        self.shared.store.close().await?;
        Ok(())
    }
}

fn stale(entry: &StreamingChannel, reason: &str) -> RelayError {
    RelayError::StaleConfiguration {
        guild_id: entry.guild_id.clone(),
        reason: format!("{} ({} / {})", reason, entry.guild_name, entry.channel_name),
    }
}

fn destroy_quietly(endpoint: &dyn VoiceEndpoint) {
    if endpoint.state().is_terminal() {
        return;
    }
    if let Err(err) = endpoint.destroy() {
        warn!(guild = %endpoint.guild_id(), "Failed to destroy endpoint: {}", err);
    }
}

fn teardown(session: GuildSession, reason: &str) {
    info!(guild = %session.guild_id(), session = session.id, "Closing session: {}", reason);
    session.player.stop();
    destroy_quietly(session.endpoint.as_ref());
}

/// Stop whatever plays, acquire a fresh resource and attach it.
async fn begin_playback(
    player: &dyn PlaybackHandle,
    provider: &dyn ResourceProvider,
    config: &PlaybackConfig,
) -> Result<()> {
    if !player.status().is_idle() {
        player.stop();
        sleep(config.stop_grace()).await;
    }
    let resource = provider.acquire().await?;
    if resource.is_degraded() {
        debug!(title = resource.title(), "Playing a fallback resource");
    }
    player.play(resource)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    IdleCheck,
    ErrorRestart,
    RetryStart,
}

enum Command {
    BeginJoin {
        guild_id: GuildId,
        reply: oneshot::Sender<Result<u64>>,
    },
    AbortJoin {
        guild_id: GuildId,
        ticket: u64,
        reply: oneshot::Sender<bool>,
    },
    Attach {
        ticket: u64,
        channel: ChannelDescriptor,
        endpoint: Arc<dyn VoiceEndpoint>,
        player: Arc<dyn PlaybackHandle>,
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        guild_id: GuildId,
        reply: oneshot::Sender<()>,
    },
    LeaveAll {
        reply: oneshot::Sender<usize>,
    },
    SetVolume {
        guild_id: GuildId,
        level: u8,
        reply: oneshot::Sender<bool>,
    },
    Status {
        guild_id: GuildId,
        reply: oneshot::Sender<SessionStatus>,
    },
    ListActive {
        reply: oneshot::Sender<Vec<GuildId>>,
    },
    Summaries {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    RestartPlayback {
        guild_id: GuildId,
        reply: oneshot::Sender<bool>,
    },
    Endpoint {
        guild_id: GuildId,
        session_id: u64,
        event: EndpointEvent,
    },
    Player {
        guild_id: GuildId,
        session_id: u64,
        event: PlayerEvent,
    },
    DisconnectVerdict {
        guild_id: GuildId,
        session_id: u64,
        healed: bool,
    },
    StartFinished {
        guild_id: GuildId,
        session_id: u64,
        outcome: std::result::Result<(), String>,
    },
    Timer {
        guild_id: GuildId,
        session_id: u64,
        kind: TimerKind,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Self::BeginJoin { .. } => "begin-join",
            Self::AbortJoin { .. } => "abort-join",
            Self::Attach { .. } => "attach",
            Self::Leave { .. } => "leave",
            Self::LeaveAll { .. } => "leave-all",
            Self::SetVolume { .. } => "set-volume",
            Self::Status { .. } => "status",
            Self::ListActive { .. } => "list-active",
            Self::Summaries { .. } => "summaries",
            Self::RestartPlayback { .. } => "restart-playback",
            Self::Endpoint { .. } => "endpoint-event",
            Self::Player { .. } => "player-event",
            Self::DisconnectVerdict { .. } => "disconnect-verdict",
            Self::StartFinished { .. } => "start-finished",
            Self::Timer { .. } => "timer",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

struct ManagerState {
    shared: Arc<Shared>,
    tx: mpsc::WeakSender<Command>,
    sessions: HashMap<GuildId, GuildSession>,
    /// Joins still handshaking, by reservation ticket.
    pending_joins: HashMap<GuildId, u64>,
    next_id: u64,
    shutdown: bool,
}

impl ManagerState {
    fn new(shared: Arc<Shared>, tx: mpsc::WeakSender<Command>) -> Self {
        Self {
            shared,
            tx,
            sessions: HashMap::new(),
            pending_joins: HashMap::new(),
            next_id: 0,
            shutdown: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("Session manager started");

        while let Some(cmd) = rx.recv().await {
            trace!(command = cmd.name(), "Manager command");
            self.handle_command(cmd);
            if self.shutdown {
                break;
            }
        }

        if !self.shutdown {
            let left = self.leave_all();
            info!(left, "All manager handles dropped");
        }
        info!("Session manager stopped");
    }

    fn weak_manager(&self) -> WeakSessionManager {
        WeakSessionManager {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::BeginJoin { guild_id, reply } => self.begin_join(guild_id, reply),
            Command::AbortJoin {
                guild_id,
                ticket,
                reply,
            } => {
                let current = self.pending_joins.get(&guild_id) == Some(&ticket);
                if current {
                    self.pending_joins.remove(&guild_id);
                }
                let _ = reply.send(current);
            }
            Command::Attach {
                ticket,
                channel,
                endpoint,
                player,
                reply,
            } => {
                let _ = reply.send(self.attach(ticket, channel, endpoint, player));
            }
            Command::Leave { guild_id, reply } => {
                self.leave(&guild_id);
                let _ = reply.send(());
            }
            Command::LeaveAll { reply } => {
                let _ = reply.send(self.leave_all());
            }
            Command::SetVolume {
                guild_id,
                level,
                reply,
            } => {
                let _ = reply.send(self.set_volume(&guild_id, level));
            }
            Command::Status { guild_id, reply } => {
                let status = match self.sessions.get(&guild_id) {
                    Some(session) => SessionStatus::Connected(session.snapshot()),
                    None => SessionStatus::NotConnected,
                };
                let _ = reply.send(status);
            }
            Command::ListActive { reply } => {
                let _ = reply.send(self.sessions.keys().cloned().collect());
            }
            Command::Summaries { reply } => {
                let _ = reply.send(self.sessions.values().map(GuildSession::summary).collect());
            }
            Command::RestartPlayback { guild_id, reply } => {
                let started = self.start_playback(&guild_id);
                let _ = reply.send(started);
            }
            Command::Endpoint {
                guild_id,
                session_id,
                event,
            } => self.on_endpoint_event(guild_id, session_id, event),
            Command::Player {
                guild_id,
                session_id,
                event,
            } => self.on_player_event(guild_id, session_id, event),
            Command::DisconnectVerdict {
                guild_id,
                session_id,
                healed,
            } => self.on_disconnect_verdict(guild_id, session_id, healed),
            Command::StartFinished {
                guild_id,
                session_id,
                outcome,
            } => self.on_start_finished(guild_id, session_id, outcome),
            Command::Timer {
                guild_id,
                session_id,
                kind,
            } => self.on_timer(guild_id, session_id, kind),
            Command::Shutdown { reply } => {
                let left = self.leave_all();
                self.shutdown = true;
                let _ = reply.send(left);
            }
        }
    }

    fn is_live(&self, guild_id: &GuildId, session_id: u64) -> bool {
        let live = self
            .sessions
            .get(guild_id)
            .is_some_and(|session| session.id == session_id);
        if !live {
            trace!(guild = %guild_id, session = session_id, "Dropping stale callback");
        }
        live
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    fn begin_join(&mut self, guild_id: GuildId, reply: oneshot::Sender<Result<u64>>) {
        if self.sessions.contains_key(&guild_id) || self.pending_joins.contains_key(&guild_id) {
            let _ = reply.send(Err(RelayError::AlreadyConnected(guild_id)));
            return;
        }

        self.next_id += 1;
        let ticket = self.next_id;
        self.pending_joins.insert(guild_id.clone(), ticket);
        if reply.send(Ok(ticket)).is_err() {
            self.pending_joins.remove(&guild_id);
        }
    }

    fn attach(
        &mut self,
        ticket: u64,
        channel: ChannelDescriptor,
        endpoint: Arc<dyn VoiceEndpoint>,
        player: Arc<dyn PlaybackHandle>,
    ) -> Result<()> {
        let guild_id = channel.guild_id.clone();
        if self.pending_joins.get(&guild_id) != Some(&ticket) {
            info!(guild = %guild_id, session = ticket, "Join cancelled during handshake");
            player.stop();
            destroy_quietly(endpoint.as_ref());
            return Err(RelayError::JoinCancelled(guild_id));
        }
        self.pending_joins.remove(&guild_id);

        let mut session = GuildSession::new(
            ticket,
            channel,
            endpoint,
            player,
            &self.shared.config.playback.retry,
        );

        let endpoint_events = session.endpoint.events();
        let endpoint = Arc::clone(&session.endpoint);
        session.track(self.forward(
            endpoint_events,
            &guild_id,
            move |guild_id, event| Command::Endpoint {
                guild_id,
                session_id: ticket,
                event,
            },
            move || {
                let state = endpoint.state();
                EndpointEvent::StateChange {
                    old: state,
                    new: state,
                }
            },
        ));
        let player_events = session.player.events();
        let player = Arc::clone(&session.player);
        session.track(self.forward(
            player_events,
            &guild_id,
            move |guild_id, event| Command::Player {
                guild_id,
                session_id: ticket,
                event,
            },
            move || {
                let status = player.status();
                PlayerEvent::StateChange {
                    old: status,
                    new: status,
                }
            },
        ));

        // Transitions between the handshake and the subscription above were
        // never forwarded.
        let state = session.endpoint.state();
        if state.is_terminal() {
            teardown(session, "endpoint destroyed before the session started");
            return Err(RelayError::transport(format!(
                "endpoint for guild {guild_id} destroyed before the session started"
            )));
        }

        info!(
            guild = %guild_id,
            session = ticket,
            "Session ready in {}",
            session.channel.channel_name
        );
        self.sessions.insert(guild_id.clone(), session);
        self.start_playback(&guild_id);
        if state == ConnectionState::Disconnected {
            warn!(guild = %guild_id, session = ticket, "Endpoint disconnected while attaching");
            self.watch_disconnect(guild_id, ticket);
        }
        Ok(())
    }

    /// Pipe a broadcast receiver into the command channel.
    ///
    /// After a lag, `resync` builds a synthetic transition carrying the
    /// current state, so a skipped transition is still acted upon.
    fn forward<E, F, R>(
        &self,
        mut events: broadcast::Receiver<E>,
        guild_id: &GuildId,
        wrap: F,
        resync: R,
    ) -> AbortHandle
    where
        E: Clone + Send + 'static,
        F: Fn(GuildId, E) -> Command + Send + 'static,
        R: Fn() -> E + Send + 'static,
    {
        let tx = self.tx.clone();
        let guild_id = guild_id.clone();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(guild = %guild_id, skipped, "Event forwarder lagged, resyncing");
                        resync()
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(tx) = tx.upgrade() else {
                    break;
                };
                if tx.send(wrap(guild_id.clone(), event)).await.is_err() {
                    break;
                }
            }
        })
        .abort_handle()
    }

    fn leave(&mut self, guild_id: &GuildId) -> bool {
        if let Some(ticket) = self.pending_joins.remove(guild_id) {
            info!(guild = %guild_id, session = ticket, "Cancelling pending join");
        }

        let had_session = match self.sessions.remove(guild_id) {
            Some(session) => {
                teardown(session, "leave requested");
                true
            }
            None => false,
        };

        // Endpoints created outside our bookkeeping (or by a cancelled join)
        if let Some(stray) = self.shared.gateway.existing_endpoint(guild_id) {
            if !stray.state().is_terminal() {
                debug!(guild = %guild_id, "Destroying stray endpoint");
                destroy_quietly(stray.as_ref());
            }
        }

        had_session
    }

    fn leave_all(&mut self) -> usize {
        let mut guilds: Vec<GuildId> = self.sessions.keys().cloned().collect();
        guilds.extend(
            self.pending_joins
                .keys()
                .filter(|guild| !self.sessions.contains_key(*guild))
                .cloned(),
        );
        guilds
            .iter()
            .filter(|guild_id| self.leave(guild_id))
            .count()
    }

    fn set_volume(&self, guild_id: &GuildId, level: u8) -> bool {
        let Some(session) = self.sessions.get(guild_id) else {
            return false;
        };
        match session.player.volume() {
            Some(volume) => {
                volume.set_percent(level);
                debug!(guild = %guild_id, level, "Volume changed");
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Connection recovery
    // ------------------------------------------------------------------

    fn on_endpoint_event(&mut self, guild_id: GuildId, session_id: u64, event: EndpointEvent) {
        if !self.is_live(&guild_id, session_id) {
            return;
        }

        match event {
            EndpointEvent::StateChange { old, new } => {
                debug!(guild = %guild_id, session = session_id, %old, %new, "Endpoint state change");
                match new {
                    ConnectionState::Disconnected => self.watch_disconnect(guild_id, session_id),
                    ConnectionState::Destroyed => {
                        if let Some(session) = self.sessions.remove(&guild_id) {
                            teardown(session, "endpoint destroyed");
                        }
                    }
                    _ => {}
                }
            }
            EndpointEvent::Error(message) => {
                warn!(guild = %guild_id, session = session_id, "Transport error: {}", message);
            }
        }
    }

    /// Give the endpoint a short window to start reconnecting by itself.
    fn watch_disconnect(&self, guild_id: GuildId, session_id: u64) {
        let Some(session) = self.sessions.get(&guild_id) else {
            return;
        };
        let endpoint = Arc::clone(&session.endpoint);
        let window = self.shared.config.connection.self_heal_window();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let healed = wait_for_any_state(
                endpoint.as_ref(),
                &[ConnectionState::Signalling, ConnectionState::Connecting],
                window,
            )
            .await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Command::DisconnectVerdict {
                        guild_id,
                        session_id,
                        healed,
                    })
                    .await;
            }
        });
    }

    fn on_disconnect_verdict(&mut self, guild_id: GuildId, session_id: u64, healed: bool) {
        if !self.is_live(&guild_id, session_id) {
            return;
        }
        if healed {
            info!(guild = %guild_id, session = session_id, "Endpoint reconnecting on its own");
            return;
        }

        let Some(session) = self.sessions.remove(&guild_id) else {
            return;
        };
        let state = session.endpoint.state();
        if state == ConnectionState::Ready || state.is_reconnecting() {
            debug!(guild = %guild_id, %state, "Endpoint recovered after the window");
            self.sessions.insert(guild_id, session);
            return;
        }

        let cooldown = self.shared.config.connection.rejoin_cooldown();
        warn!(
            guild = %guild_id,
            session = session_id,
            "Connection lost, rejoining in {:?}",
            cooldown
        );
        teardown(session, "connection lost");
        self.weak_manager().schedule_rejoin(guild_id, cooldown);
    }

    // ------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------

    /// Launch a start unless one is in flight.
    fn start_playback(&mut self, guild_id: &GuildId) -> bool {
        let Some(session) = self.sessions.get_mut(guild_id) else {
            return false;
        };
        if !session.phase.try_start() {
            debug!(guild = %guild_id, session = session.id, "Playback start already in flight");
            return false;
        }

        let player = Arc::clone(&session.player);
        let provider = Arc::clone(&self.shared.provider);
        let config = self.shared.config.playback.clone();
        let tx = self.tx.clone();
        let session_id = session.id;
        let task_guild = guild_id.clone();

        let task = tokio::spawn(async move {
            let outcome = begin_playback(player.as_ref(), provider.as_ref(), &config).await;
            if outcome.is_ok() {
                // Stay in Starting while the provider settles
                sleep(config.start_settle()).await;
            }
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Command::StartFinished {
                        guild_id: task_guild,
                        session_id,
                        outcome: outcome.map_err(|err| err.to_string()),
                    })
                    .await;
            }
        });

        session.record_start(task.abort_handle());
        debug!(guild = %guild_id, session = session_id, "Playback start requested");
        true
    }

    fn on_start_finished(
        &mut self,
        guild_id: GuildId,
        session_id: u64,
        outcome: std::result::Result<(), String>,
    ) {
        if !self.is_live(&guild_id, session_id) {
            return;
        }
        let Some(session) = self.sessions.get_mut(&guild_id) else {
            return;
        };

        match &outcome {
            Ok(()) => debug!(guild = %guild_id, session = session_id, "Playback started"),
            Err(message) => {
                warn!(guild = %guild_id, session = session_id, "Playback start failed: {}", message)
            }
        }
        let status = session.player.status();
        let reaction = session.phase.finish_start(outcome.is_ok(), status);
        self.react(&guild_id, reaction);
    }

    fn on_player_event(&mut self, guild_id: GuildId, session_id: u64, event: PlayerEvent) {
        if !self.is_live(&guild_id, session_id) {
            return;
        }
        let Some(session) = self.sessions.get_mut(&guild_id) else {
            return;
        };

        match event {
            PlayerEvent::StateChange { old, new } => {
                debug!(
                    guild = %guild_id,
                    session = session_id,
                    %old,
                    %new,
                    phase = %session.phase,
                    "Player state change"
                );
                let reaction = session.phase.on_status(new);
                self.react(&guild_id, reaction);
            }
            PlayerEvent::Error(message) => {
                let delay = self.shared.config.playback.error_restart_delay();
                warn!(
                    guild = %guild_id,
                    session = session_id,
                    "Player error, restarting in {:?}: {}",
                    delay,
                    message
                );
                self.schedule_timer(guild_id, session_id, TimerKind::ErrorRestart, delay);
            }
        }
    }

    fn react(&mut self, guild_id: &GuildId, reaction: Reaction) {
        let Some(session) = self.sessions.get_mut(guild_id) else {
            return;
        };
        let session_id = session.id;

        match reaction {
            Reaction::None => {}
            Reaction::Recovered => session.backoff.reset(),
            Reaction::Unpause => {
                if session.player.unpause() {
                    info!(guild = %guild_id, session = session_id, "Player auto-paused, resumed");
                }
            }
            Reaction::ArmIdleCheck => {
                let delay = self.shared.config.playback.idle_restart_delay();
                info!(
                    guild = %guild_id,
                    session = session_id,
                    "Playback went idle, checking again in {:?}",
                    delay
                );
                self.schedule_timer(guild_id.clone(), session_id, TimerKind::IdleCheck, delay);
            }
            Reaction::ScheduleRetry => {
                let delay = session.backoff.next_delay();
                let failures = session.backoff.failures();
                warn!(
                    guild = %guild_id,
                    session = session_id,
                    failures,
                    "Retrying playback start in {:?}",
                    delay
                );
                self.schedule_timer(guild_id.clone(), session_id, TimerKind::RetryStart, delay);
            }
        }
    }

    fn schedule_timer(&self, guild_id: GuildId, session_id: u64, kind: TimerKind, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Command::Timer {
                        guild_id,
                        session_id,
                        kind,
                    })
                    .await;
            }
        });
    }

    fn on_timer(&mut self, guild_id: GuildId, session_id: u64, kind: TimerKind) {
        if !self.is_live(&guild_id, session_id) {
            return;
        }
        let Some(session) = self.sessions.get_mut(&guild_id) else {
            return;
        };

        let should_start = match kind {
            TimerKind::IdleCheck => {
                let still_idle = session.phase.idle_check(session.player.status());
                if !still_idle {
                    debug!(guild = %guild_id, phase = %session.phase, "Playback recovered on its own");
                }
                still_idle
            }
            TimerKind::ErrorRestart => true,
            TimerKind::RetryStart => session.phase == PlaybackPhase::Idle,
        };

        if should_start {
            self.start_playback(&guild_id);
        }
    }
}
