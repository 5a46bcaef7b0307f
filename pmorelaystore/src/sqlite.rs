//! SQLite-backed [`ChannelStore`] with a small key/value settings table.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pmorelay::{ChannelId, ChannelStore, GuildId, NewStreamingChannel, StreamingChannel};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS streaming_channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guild_id TEXT NOT NULL UNIQUE,
    channel_id TEXT NOT NULL,
    guild_name TEXT NOT NULL,
    channel_name TEXT NOT NULL,
    added_by TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS bot_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
"#;

const SELECT_CHANNEL: &str = "SELECT guild_id, channel_id, guild_name, channel_name, added_by, \
     created_at_ms, updated_at_ms FROM streaming_channels";

type SharedConnection = Arc<StdMutex<Option<Connection>>>;

pub struct SqliteChannelStore {
    conn: SharedConnection,
}

impl SqliteChannelStore {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> anyhow::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(Some(conn))),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let conn = guard.as_ref().ok_or_else(|| anyhow!("Store is closed"))?;
            f(conn)
        })
        .await?
    }

    pub async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM bot_settings WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    /// Insert or replace a setting. The creation date of an existing key is kept.
    pub async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bot_settings (key, value, created_at_ms, updated_at_ms) \
                 VALUES (?1, ?2, ?3, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 updated_at_ms = excluded.updated_at_ms",
                params![key, value, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_setting(&self, key: &str) -> anyhow::Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM bot_settings WHERE key = ?1", params![key])?;
            Ok(removed > 0)
        })
        .await
    }
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn row_to_channel(row: &Row<'_>) -> rusqlite::Result<StreamingChannel> {
    Ok(StreamingChannel {
        guild_id: GuildId::new(row.get::<_, String>(0)?),
        channel_id: ChannelId::new(row.get::<_, String>(1)?),
        guild_name: row.get(2)?,
        channel_name: row.get(3)?,
        added_by: row.get(4)?,
        created_at: timestamp(row.get(5)?),
        updated_at: timestamp(row.get(6)?),
    })
}

fn select_by_guild(conn: &Connection, guild_id: &str) -> anyhow::Result<Option<StreamingChannel>> {
    let sql = format!("{SELECT_CHANNEL} WHERE guild_id = ?1");
    Ok(conn
        .query_row(&sql, params![guild_id], row_to_channel)
        .optional()?)
}

#[async_trait]
impl ChannelStore for SqliteChannelStore {
    async fn find_all(&self) -> anyhow::Result<Vec<StreamingChannel>> {
        self.with_conn(|conn| {
            let sql = format!("{SELECT_CHANNEL} ORDER BY id ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_channel)?;
            let mut channels = Vec::new();
            for row in rows {
                channels.push(row?);
            }
            Ok(channels)
        })
        .await
    }

    async fn find_by_guild(&self, guild_id: &GuildId) -> anyhow::Result<Option<StreamingChannel>> {
        let guild_id = guild_id.to_string();
        self.with_conn(move |conn| select_by_guild(conn, &guild_id)).await
    }

    async fn upsert(&self, entry: NewStreamingChannel) -> anyhow::Result<StreamingChannel> {
        let now = Utc::now().timestamp_millis();
        let record = self
            .with_conn(move |conn| {
                let guild_id = entry.guild_id.to_string();
                conn.execute(
                    "INSERT INTO streaming_channels \
                     (guild_id, channel_id, guild_name, channel_name, added_by, created_at_ms, updated_at_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
                     ON CONFLICT(guild_id) DO UPDATE SET \
                     channel_id = excluded.channel_id, \
                     channel_name = excluded.channel_name, \
                     updated_at_ms = excluded.updated_at_ms",
                    params![
                        guild_id,
                        entry.channel_id.to_string(),
                        entry.guild_name,
                        entry.channel_name,
                        entry.added_by,
                        now
                    ],
                )?;
                select_by_guild(conn, &guild_id)?
                    .ok_or_else(|| anyhow!("Entry for guild {} vanished after upsert", guild_id))
            })
            .await?;
        debug!(guild = %record.guild_id, channel = %record.channel_id, "Streaming channel saved");
        Ok(record)
    }

    async fn delete(&self, guild_id: &GuildId) -> anyhow::Result<bool> {
        let guild_id = guild_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM streaming_channels WHERE guild_id = ?1",
                params![guild_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn count(&self) -> anyhow::Result<usize> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM streaming_channels", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn close(&self) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let taken = conn
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(conn) = taken {
                conn.close().map_err(|(_, err)| err)?;
                info!("Channel store closed");
            }
            Ok(())
        })
        .await?
    }
}
