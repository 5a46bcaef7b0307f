//! # pmorelaystore
//!
//! Durable storage for the relay: the per-guild channel assignments read by
//! `pmorelay::SessionManager`, plus a free-form `bot_settings` table.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use pmorelay::ChannelStore;
//!
//! let config = pmoconfig::get_config();
//! let store = pmorelaystore::store_from_config(&config)?;
//! println!("{} configured guilds", store.count().await?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use config::StoreConfig;
pub use sqlite::SqliteChannelStore;

/// Open the SQLite store described by the `store` section.
pub fn store_from_config(config: &pmoconfig::Config) -> anyhow::Result<Arc<SqliteChannelStore>> {
    let store_config = StoreConfig::from_config(config);
    let path = store_config.database_path(config)?;
    let store = SqliteChannelStore::new(&path)?;
    info!(path = %path.display(), "Channel store opened");
    Ok(Arc::new(store))
}
