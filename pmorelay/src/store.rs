//! Configuration store seam: which channel each guild streams to.
//!
//! The manager only reads it (startup sweep, rejoin) and prunes entries whose
//! guild has disappeared. Everything else belongs to the surrounding
//! application. `MemoryChannelStore` backs tests and dry runs; the SQLite
//! implementation lives in `pmorelaystore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::model::{ChannelId, GuildId};

/// Persisted record describing where a guild wants the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingChannel {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub guild_name: String,
    pub channel_name: String,
    pub added_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input of `ChannelStore::upsert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStreamingChannel {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub guild_name: String,
    pub channel_name: String,
    pub added_by: Option<String>,
}

impl NewStreamingChannel {
    pub fn new(
        guild_id: impl Into<GuildId>,
        channel_id: impl Into<ChannelId>,
        guild_name: impl Into<String>,
        channel_name: impl Into<String>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            guild_name: guild_name.into(),
            channel_name: channel_name.into(),
            added_by: None,
        }
    }

    pub fn added_by(mut self, user: impl Into<String>) -> Self {
        self.added_by = Some(user.into());
        self
    }
}

/// Abstract persistence interface.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn find_all(&self) -> anyhow::Result<Vec<StreamingChannel>>;

    async fn find_by_guild(&self, guild_id: &GuildId) -> anyhow::Result<Option<StreamingChannel>>;

    /// Insert the entry, or update channel id/name of an existing one.
    /// `added_by` and `created_at` of an existing entry are kept.
    async fn upsert(&self, entry: NewStreamingChannel) -> anyhow::Result<StreamingChannel>;

    /// Returns `true` if an entry was removed.
    async fn delete(&self, guild_id: &GuildId) -> anyhow::Result<bool>;

    async fn count(&self) -> anyhow::Result<usize>;

    /// Release underlying resources. Called once at shutdown.
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Volatile store for tests and dry runs.
///
/// ```
/// use pmorelay::{ChannelStore, GuildId, MemoryChannelStore, NewStreamingChannel};
///
/// # tokio_test::block_on(async {
/// let store = MemoryChannelStore::new();
/// store
///     .upsert(NewStreamingChannel::new("g1", "c1", "Guild", "General"))
///     .await
///     .unwrap();
/// assert!(store.find_by_guild(&GuildId::new("g1")).await.unwrap().is_some());
/// # });
/// ```
#[derive(Default)]
pub struct MemoryChannelStore {
    entries: Mutex<BTreeMap<GuildId, StreamingChannel>>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn find_all(&self) -> anyhow::Result<Vec<StreamingChannel>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }

    async fn find_by_guild(&self, guild_id: &GuildId) -> anyhow::Result<Option<StreamingChannel>> {
        Ok(self.entries.lock().await.get(guild_id).cloned())
    }

    async fn upsert(&self, entry: NewStreamingChannel) -> anyhow::Result<StreamingChannel> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let record = match entries.get(&entry.guild_id) {
            Some(existing) => StreamingChannel {
                channel_id: entry.channel_id,
                channel_name: entry.channel_name,
                updated_at: now,
                ..existing.clone()
            },
            None => StreamingChannel {
                guild_id: entry.guild_id.clone(),
                channel_id: entry.channel_id,
                guild_name: entry.guild_name,
                channel_name: entry.channel_name,
                added_by: entry.added_by,
                created_at: now,
                updated_at: now,
            },
        };
        entries.insert(entry.guild_id, record.clone());
        Ok(record)
    }

    async fn delete(&self, guild_id: &GuildId) -> anyhow::Result<bool> {
        Ok(self.entries.lock().await.remove(guild_id).is_some())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.entries.lock().await.len())
    }
}
