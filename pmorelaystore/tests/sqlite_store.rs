use pmorelay::{ChannelId, ChannelStore, GuildId, NewStreamingChannel};
use pmorelaystore::{store_from_config, SqliteChannelStore};

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("relay.db");

    {
        let store = SqliteChannelStore::new(&path).unwrap();
        store
            .upsert(NewStreamingChannel::new("g1", "c1", "First", "General").added_by("admin"))
            .await
            .unwrap();
        store
            .upsert(NewStreamingChannel::new("g2", "c9", "Second", "Music"))
            .await
            .unwrap();
        store.set_setting("station", "HiiZun Radio").await.unwrap();
        store.close().await.unwrap();
    }

    let store = SqliteChannelStore::new(&path).unwrap();
    let all = store.find_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].guild_id, GuildId::new("g1"));
    assert_eq!(all[0].added_by.as_deref(), Some("admin"));
    assert_eq!(all[1].channel_id, ChannelId::new("c9"));
    assert!(all[1].added_by.is_none());
    assert_eq!(
        store.get_setting("station").await.unwrap().as_deref(),
        Some("HiiZun Radio")
    );
}

#[tokio::test]
async fn test_upsert_refreshes_update_time_only() {
    let store = SqliteChannelStore::in_memory().unwrap();
    let first = store
        .upsert(NewStreamingChannel::new("g1", "c1", "Guild", "General"))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store
        .upsert(NewStreamingChannel::new("g1", "c2", "Guild", "Lounge"))
        .await
        .unwrap();

    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
}

#[tokio::test]
async fn test_find_and_delete_by_guild() {
    let store = SqliteChannelStore::in_memory().unwrap();
    store
        .upsert(NewStreamingChannel::new("g1", "c1", "Guild", "General"))
        .await
        .unwrap();

    let g1 = GuildId::new("g1");
    assert!(store.find_by_guild(&g1).await.unwrap().is_some());
    assert!(store.find_by_guild(&GuildId::new("g2")).await.unwrap().is_none());

    assert!(store.delete(&g1).await.unwrap());
    assert!(!store.delete(&g1).await.unwrap());
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_from_config_uses_store_section() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.yaml"),
        "store:\n  directory: db\n  file_name: test.db\n",
    )
    .unwrap();
    let cfg = pmoconfig::Config::load_config(dir.path().to_str().unwrap()).unwrap();

    let store = store_from_config(&cfg).unwrap();
    store
        .upsert(NewStreamingChannel::new("g1", "c1", "Guild", "General"))
        .await
        .unwrap();

    assert!(dir.path().join("db").join("test.db").exists());
    store.close().await.unwrap();
}
