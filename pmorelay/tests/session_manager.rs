//! Session manager behaviour against the loopback transport.
//!
//! All tests run on a paused clock: sleeps advance virtual time as soon as
//! every task is idle, so recovery delays are exercised without waiting.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use pmorelay::loopback::{Handshake, LoopbackGateway};
use pmorelay::{
    AudioResource, ChannelDescriptor, ChannelId, ChannelStore, ConnectionState, GuildId,
    MemoryChannelStore, NewStreamingChannel, PlaybackHandle, PlaybackPhase, PlaybackStatus,
    RelayConfig, RelayError, ResourceProvider, SessionManager, SessionStatus, VoiceEndpoint,
    VoiceGateway,
};

/// Endless resource, counting acquisitions.
#[derive(Default)]
struct CountingProvider {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl CountingProvider {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceProvider for CountingProvider {
    async fn acquire(&self) -> pmorelay::Result<AudioResource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::playback("upstream unavailable"));
        }
        let stream = futures::stream::pending::<std::io::Result<Bytes>>().boxed();
        Ok(AudioResource::new("Test Radio", stream).with_inline_volume(0.5))
    }
}

struct Fixture {
    gateway: Arc<LoopbackGateway>,
    provider: Arc<CountingProvider>,
    store: Arc<MemoryChannelStore>,
    manager: SessionManager,
}

impl Fixture {
    fn new() -> Self {
        let gateway = Arc::new(LoopbackGateway::new());
        for guild in ["g1", "g2", "g3"] {
            gateway.add_guild(guild, format!("Guild {guild}"));
            gateway.add_channel(guild, "c1", "General");
        }
        let provider = Arc::new(CountingProvider::default());
        let store = Arc::new(MemoryChannelStore::new());
        let manager = SessionManager::spawn(
            gateway.clone(),
            provider.clone(),
            store.clone(),
            RelayConfig::default(),
        );
        Self {
            gateway,
            provider,
            store,
            manager,
        }
    }

    /// Record the guild in the store and resolve its channel.
    async fn configure(&self, guild: &str) -> ChannelDescriptor {
        self.store
            .upsert(NewStreamingChannel::new(guild, "c1", format!("Guild {guild}"), "General"))
            .await
            .unwrap();
        self.gateway
            .channel(&GuildId::new(guild), &ChannelId::new("c1"))
            .unwrap()
    }

    async fn join(&self, guild: &str) {
        let channel = self.configure(guild).await;
        self.manager.join_session(channel).await.unwrap();
    }

    async fn phase(&self, guild: &str) -> Option<PlaybackPhase> {
        self.manager
            .get_status(&GuildId::new(guild))
            .await
            .snapshot()
            .map(|snapshot| snapshot.phase)
    }

    fn attempts(&self, guild: &str) -> usize {
        self.gateway
            .connect_attempts()
            .iter()
            .filter(|attempt| attempt.guild_id.as_str() == guild)
            .count()
    }
}

fn gid(id: &str) -> GuildId {
    GuildId::new(id)
}

async fn tick() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_join_creates_a_live_session() {
    let fx = Fixture::new();
    fx.join("g1").await;

    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);
    let status = fx.manager.get_status(&gid("g1")).await;
    assert!(status.is_connected());
    let snapshot = status.snapshot().unwrap();
    assert_eq!(snapshot.connection, ConnectionState::Ready);
    assert_eq!(snapshot.channel_id, ChannelId::new("c1"));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(fx.provider.calls(), 1);
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::Playing));
    let player = fx.gateway.player(&gid("g1")).unwrap();
    assert_eq!(player.status(), PlaybackStatus::Playing);
    assert_eq!(player.play_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_twice_is_rejected() {
    let fx = Fixture::new();
    fx.join("g1").await;

    let channel = fx.configure("g1").await;
    let err = fx.manager.join_session(channel).await.unwrap_err();
    assert!(matches!(err, RelayError::AlreadyConnected(ref g) if *g == gid("g1")));
    assert_eq!(fx.attempts("g1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_is_idempotent() {
    let fx = Fixture::new();
    fx.join("g1").await;
    let endpoint = fx.gateway.endpoint(&gid("g1")).unwrap();

    fx.manager.leave_session(&gid("g1")).await;
    fx.manager.leave_session(&gid("g1")).await;

    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(
        fx.manager.get_status(&gid("g1")).await,
        SessionStatus::NotConnected
    );
    assert_eq!(endpoint.state(), ConnectionState::Destroyed);
    assert_eq!(endpoint.destroy_count(), 1);

    // Timers of the old session never resurrect it
    sleep(Duration::from_secs(60)).await;
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(fx.attempts("g1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_without_session_destroys_stray_endpoint() {
    let fx = Fixture::new();
    let channel = fx.configure("g2").await;
    let stray = fx.gateway.inject_endpoint(&channel);

    fx.manager.leave_session(&gid("g2")).await;

    assert_eq!(stray.state(), ConnectionState::Destroyed);
    assert_eq!(stray.destroy_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_set_volume() {
    let fx = Fixture::new();
    assert!(!fx.manager.set_volume(&gid("g1"), 40).await);

    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    let before = fx.manager.get_status(&gid("g1")).await;
    assert!(fx.manager.set_volume(&gid("g1"), 30).await);
    let after = fx.manager.get_status(&gid("g1")).await;
    assert_eq!(before, after);

    let volume = fx.gateway.player(&gid("g1")).unwrap().volume().unwrap();
    assert!((volume.get() - 0.3).abs() < 1e-6);
    assert_eq!(fx.provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_single_start_in_flight() {
    let fx = Fixture::new();
    fx.join("g1").await;
    tick().await;

    // The initial start is still settling
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::Starting));
    assert!(!fx.manager.restart_playback(&gid("g1")).await);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(fx.provider.calls(), 1);

    // Spontaneous idle and an explicit restart at the same time
    let player = fx.gateway.player(&gid("g1")).unwrap();
    player.set_status(PlaybackStatus::Idle);
    tick().await;
    assert!(fx.manager.restart_playback(&gid("g1")).await);
    assert!(!fx.manager.restart_playback(&gid("g1")).await);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(fx.provider.calls(), 2);
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::Playing));
}

#[tokio::test(start_paused = true)]
async fn test_idle_recovering_within_window_is_left_alone() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    let player = fx.gateway.player(&gid("g1")).unwrap();
    player.set_status(PlaybackStatus::Idle);
    tick().await;
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::RestartPending));

    sleep(Duration::from_secs(5)).await;
    player.set_status(PlaybackStatus::Playing);
    sleep(Duration::from_secs(20)).await;

    assert_eq!(fx.provider.calls(), 1);
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::Playing));
}

#[tokio::test(start_paused = true)]
async fn test_idle_restart_after_delay() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    let player = fx.gateway.player(&gid("g1")).unwrap();
    player.set_status(PlaybackStatus::Idle);

    sleep(Duration::from_secs(9)).await;
    assert_eq!(fx.provider.calls(), 1);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(fx.provider.calls(), 2);
    assert_eq!(player.status(), PlaybackStatus::Playing);
}

#[tokio::test(start_paused = true)]
async fn test_autopause_is_resumed() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    let player = fx.gateway.player(&gid("g1")).unwrap();
    player.set_status(PlaybackStatus::AutoPaused);
    tick().await;

    assert_eq!(player.status(), PlaybackStatus::Playing);
    assert_eq!(fx.provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_player_error_restarts_after_delay() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    fx.gateway.player(&gid("g1")).unwrap().emit_error("decoder crashed");

    sleep(Duration::from_secs(4)).await;
    assert_eq!(fx.provider.calls(), 1);

    // Restart at 5 s, then the stop grace before acquiring
    sleep(Duration::from_secs(3)).await;
    assert_eq!(fx.provider.calls(), 2);

    let stats = fx.manager.stats().await.unwrap();
    assert_eq!(stats.sessions[0].restarts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_is_retried_until_upstream_recovers() {
    let fx = Fixture::new();
    fx.provider.set_failing(true);
    fx.join("g1").await;
    tick().await;
    assert_eq!(fx.provider.calls(), 1);
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::Idle));

    sleep(Duration::from_secs(9)).await;
    assert_eq!(fx.provider.calls(), 2);
    let stats = fx.manager.stats().await.unwrap();
    assert_eq!(stats.sessions[0].consecutive_failures, 2);

    fx.provider.set_failing(false);
    sleep(Duration::from_secs(8)).await;
    assert_eq!(fx.provider.calls(), 3);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::Playing));
    let stats = fx.manager.stats().await.unwrap();
    assert_eq!(stats.sessions[0].consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_rejoins_once() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    let first = fx.gateway.endpoint(&gid("g1")).unwrap();
    first.set_state(ConnectionState::Disconnected);

    // No self-heal: the session is gone and the endpoint destroyed
    sleep(Duration::from_secs(6)).await;
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(first.state(), ConnectionState::Destroyed);
    assert_eq!(first.destroy_count(), 1);

    // The rejoin fires once, after the cooldown
    sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);
    assert_eq!(fx.attempts("g1"), 2);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.attempts("g1"), 2);
    assert_eq!(fx.provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_self_healed_disconnect_keeps_session() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    let endpoint = fx.gateway.endpoint(&gid("g1")).unwrap();
    endpoint.set_state(ConnectionState::Disconnected);
    sleep(Duration::from_secs(2)).await;
    endpoint.set_state(ConnectionState::Connecting);
    endpoint.set_state(ConnectionState::Ready);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);
    assert_eq!(endpoint.destroy_count(), 0);
    assert_eq!(fx.attempts("g1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_external_destroy_removes_session_without_rejoin() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    fx.gateway.endpoint(&gid("g1")).unwrap().destroy().unwrap();
    tick().await;
    assert!(fx.manager.list_active().await.is_empty());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(fx.attempts("g1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_error_keeps_session() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    let endpoint = fx.gateway.endpoint(&gid("g1")).unwrap();
    endpoint.emit_error("udp socket reset");
    tick().await;
    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);
    assert_eq!(endpoint.destroy_count(), 0);
    assert_eq!(endpoint.state(), ConnectionState::Ready);
    assert_eq!(fx.attempts("g1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_attaching_is_recovered() {
    let fx = Fixture::new();
    fx.gateway
        .fault_on_subscribe("g1", ConnectionState::Disconnected);
    fx.join("g1").await;
    let first = fx.gateway.endpoint(&gid("g1")).unwrap();
    assert_eq!(first.state(), ConnectionState::Disconnected);

    // Self-heal window elapses without the endpoint reconnecting
    sleep(Duration::from_secs(6)).await;
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(first.state(), ConnectionState::Destroyed);
    assert_eq!(first.destroy_count(), 1);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.attempts("g1"), 2);
    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);
    let status = fx.manager.get_status(&gid("g1")).await;
    assert_eq!(status.snapshot().unwrap().connection, ConnectionState::Ready);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.attempts("g1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_while_attaching_fails_the_join() {
    let fx = Fixture::new();
    fx.gateway.fault_on_subscribe("g1", ConnectionState::Destroyed);
    let channel = fx.configure("g1").await;

    let err = fx.manager.join_session(channel).await.unwrap_err();
    assert!(matches!(err, RelayError::Transport(_)));
    assert!(fx.manager.list_active().await.is_empty());

    sleep(Duration::from_secs(60)).await;
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(fx.attempts("g1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_lost_in_event_lag_is_recovered() {
    let fx = Fixture::new();
    fx.join("g1").await;
    sleep(Duration::from_secs(3)).await;

    // The transition is pushed out of the event buffer before the
    // forwarder gets to run
    let first = fx.gateway.endpoint(&gid("g1")).unwrap();
    first.set_state(ConnectionState::Disconnected);
    for i in 0..200 {
        first.emit_error(format!("packet loss {i}"));
    }

    sleep(Duration::from_secs(6)).await;
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(first.destroy_count(), 1);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.attempts("g1"), 2);
    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);
}

#[tokio::test(start_paused = true)]
async fn test_join_leave_join_gives_an_independent_session() {
    let fx = Fixture::new();
    fx.join("g1").await;
    // Error restart armed for the first session
    fx.gateway.player(&gid("g1")).unwrap().emit_error("boom");
    tick().await;

    fx.manager.leave_session(&gid("g1")).await;
    fx.join("g1").await;
    assert_eq!(fx.phase("g1").await, Some(PlaybackPhase::Starting));

    sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.provider.calls(), 2);
    let stats = fx.manager.stats().await.unwrap();
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.sessions[0].restarts, 0);
    assert_eq!(fx.gateway.endpoints(&gid("g1")).len(), 2);
    assert_eq!(
        fx.gateway.endpoints(&gid("g1"))[0].state(),
        ConnectionState::Destroyed
    );
}

#[tokio::test(start_paused = true)]
async fn test_join_timeout_leaves_nothing_behind() {
    let fx = Fixture::new();
    fx.gateway.set_handshake("g1", Handshake::Never);
    let channel = fx.configure("g1").await;

    let err = fx.manager.join_session(channel.clone()).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(
        fx.gateway.endpoint(&gid("g1")).unwrap().state(),
        ConnectionState::Destroyed
    );

    fx.gateway.set_handshake("g1", Handshake::Immediate);
    fx.manager.join_session(channel).await.unwrap();
    assert_eq!(fx.manager.list_active().await, vec![gid("g1")]);
}

#[tokio::test(start_paused = true)]
async fn test_leave_during_handshake_cancels_join() {
    let fx = Fixture::new();
    fx.gateway.set_handshake("g1", Handshake::Never);
    let channel = fx.configure("g1").await;

    let manager = fx.manager.clone();
    let join = tokio::spawn(async move { manager.join_session(channel).await });
    sleep(Duration::from_secs(1)).await;

    fx.manager.leave_session(&gid("g1")).await;
    let err = join.await.unwrap().unwrap_err();
    assert!(matches!(err, RelayError::JoinCancelled(_)));
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(
        fx.gateway.endpoint(&gid("g1")).unwrap().state(),
        ConnectionState::Destroyed
    );
}

#[tokio::test(start_paused = true)]
async fn test_sweep_spaces_join_attempts() {
    let fx = Fixture::new();
    for guild in ["g1", "g2", "g3"] {
        fx.configure(guild).await;
    }

    let report = fx.manager.reconnect_all().await.unwrap();
    assert_eq!(report.joined.len(), 3);

    let attempts = fx.gateway.connect_attempts();
    assert_eq!(attempts.len(), 3);
    for pair in attempts.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(2000));
    }
}

#[tokio::test(start_paused = true)]
async fn test_sweep_prunes_entries_of_vanished_guilds() {
    let fx = Fixture::new();
    fx.configure("g1").await;
    fx.configure("g2").await;
    fx.gateway.remove_guild(&gid("g1"));

    let report = fx.manager.reconnect_all().await.unwrap();
    assert_eq!(report.pruned, vec![gid("g1")]);
    assert_eq!(report.joined, vec![gid("g2")]);
    assert!(fx.store.find_by_guild(&gid("g1")).await.unwrap().is_none());
    assert_eq!(fx.store.count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_keeps_entries_of_missing_channels() {
    let fx = Fixture::new();
    fx.configure("g1").await;
    fx.gateway.remove_channel(&gid("g1"), &ChannelId::new("c1"));

    let report = fx.manager.reconnect_all().await.unwrap();
    assert_eq!(report.skipped, vec![gid("g1")]);
    assert!(report.joined.is_empty());
    assert_eq!(fx.store.count().await.unwrap(), 1);
    assert_eq!(fx.attempts("g1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_failure_is_retried_once() {
    let fx = Fixture::new();
    fx.configure("g1").await;
    fx.configure("g2").await;
    fx.gateway
        .set_handshake("g1", Handshake::Fail("gateway refused".into()));

    let report = fx.manager.reconnect_all().await.unwrap();
    assert_eq!(report.failed, vec![gid("g1")]);
    assert_eq!(report.joined, vec![gid("g2")]);

    fx.gateway.set_handshake("g1", Handshake::Immediate);
    sleep(Duration::from_secs(31)).await;
    assert_eq!(fx.attempts("g1"), 2);
    let mut active = fx.manager.list_active().await;
    active.sort();
    assert_eq!(active, vec![gid("g1"), gid("g2")]);

    sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.attempts("g1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_is_quiet_when_nothing_to_do() {
    let fx = Fixture::new();

    // Not configured
    fx.manager.rejoin_session(&gid("g3")).await.unwrap();
    assert_eq!(fx.attempts("g3"), 0);

    // Already connected
    fx.join("g1").await;
    fx.manager.rejoin_session(&gid("g1")).await.unwrap();
    assert_eq!(fx.attempts("g1"), 1);

    // Channel vanished
    fx.configure("g2").await;
    fx.gateway.remove_channel(&gid("g2"), &ChannelId::new("c1"));
    fx.manager.rejoin_session(&gid("g2")).await.unwrap();
    assert_eq!(fx.attempts("g2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_forget_guild_drops_session_and_entry() {
    let fx = Fixture::new();
    fx.join("g1").await;

    assert!(fx.manager.forget_guild(&gid("g1")).await.unwrap());
    assert!(fx.manager.list_active().await.is_empty());
    assert_eq!(fx.store.count().await.unwrap(), 0);
    assert!(!fx.manager.forget_guild(&gid("g1")).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_restart_all_rebuilds_every_session() {
    let fx = Fixture::new();
    fx.join("g1").await;
    fx.join("g2").await;

    let report = fx.manager.restart_all().await.unwrap();
    assert_eq!(report.joined.len(), 2);
    assert_eq!(fx.attempts("g1"), 2);
    assert_eq!(fx.attempts("g2"), 2);
    assert_eq!(fx.manager.list_active().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stats_and_leave_all() {
    let fx = Fixture::new();
    fx.join("g1").await;
    fx.join("g2").await;
    fx.configure("g3").await;

    let stats = fx.manager.stats().await.unwrap();
    assert_eq!(stats.configured_channels, 3);
    assert_eq!(stats.active_sessions, 2);

    assert_eq!(fx.manager.leave_all().await, 2);
    assert!(fx.manager.list_active().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_the_manager() {
    let fx = Fixture::new();
    fx.join("g1").await;
    let endpoint = fx.gateway.endpoint(&gid("g1")).unwrap();

    fx.manager.shutdown().await.unwrap();
    tick().await;

    assert!(fx.manager.is_closed());
    assert_eq!(endpoint.state(), ConnectionState::Destroyed);
    assert_eq!(
        fx.manager.get_status(&gid("g1")).await,
        SessionStatus::NotConnected
    );
    fx.manager.leave_session(&gid("g1")).await;

    let channel = fx.configure("g1").await;
    assert!(matches!(
        fx.manager.join_session(channel).await,
        Err(RelayError::ManagerClosed)
    ));
    assert!(matches!(
        fx.manager.shutdown().await,
        Err(RelayError::ManagerClosed)
    ));
}
