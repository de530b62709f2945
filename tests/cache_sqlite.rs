use survey_tagger::cache::{CallCacheKey, SqliteCallCache};
use survey_tagger::prompts::NORMALIZE;
use survey_tagger::CallCache;
use tempfile::tempdir;

const MODEL: &str = "mistralai/mistral-large";

fn key_for(tags: &str) -> CallCacheKey {
    let prompt = NORMALIZE.render(&[("tags", tags)]);
    CallCacheKey::new(MODEL, &prompt, 4000)
}

fn hit_count(db_path: &std::path::Path, key: &CallCacheKey) -> i64 {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.query_row(
        "SELECT hit_count FROM model_calls WHERE key_hash = ?1",
        rusqlite::params![key.key_hash],
        |row| row.get(0),
    )
    .unwrap()
}

#[tokio::test]
async fn sqlite_cache_put_get_increments_hit_count() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCallCache::new(&db_path).unwrap();

    let key = key_for("- slow app\n- lag");
    assert!(cache.get(&key).await.unwrap().is_none());

    let output = r#"{"Performance": ["slow app", "lag"]}"#;
    cache.put(&key, output).await.unwrap();

    let hit1 = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit1, output);
    let _ = cache.get(&key).await.unwrap().unwrap();

    assert_eq!(hit_count(&db_path, &key), 2);
    assert_eq!(cache.len().await.unwrap(), 1);
}

#[tokio::test]
async fn sqlite_cache_put_overwrites_existing_content() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCallCache::new(&db_path).unwrap();

    let key = key_for("- pricing");
    cache.put(&key, "first").await.unwrap();
    cache.put(&key, "second").await.unwrap();

    assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("second"));
    assert_eq!(cache.len().await.unwrap(), 1);
}

#[tokio::test]
async fn sqlite_cache_survives_reopen() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let key = key_for("- support");

    {
        let cache = SqliteCallCache::new(&db_path).unwrap();
        cache.put(&key, "[]").await.unwrap();
    }

    let reopened = SqliteCallCache::new(&db_path).unwrap();
    assert_eq!(reopened.get(&key).await.unwrap().as_deref(), Some("[]"));
}

#[tokio::test]
async fn sqlite_cache_prune_max_rows_keeps_most_recent() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCallCache::new(&db_path).unwrap();

    let old_key = key_for("- slow app");
    let new_key = key_for("- pricing");

    cache.put(&old_key, "old").await.unwrap();
    cache.put(&new_key, "new").await.unwrap();

    // Make the "old" row deterministically older so prune ordering is stable.
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE model_calls SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![old_key.key_hash],
    )
    .unwrap();

    let stats = cache.prune(None, Some(1)).await.unwrap();
    assert_eq!(stats.remaining, 1);
    assert_eq!(stats.deleted, 1);

    assert!(cache.get(&old_key).await.unwrap().is_none());
    assert_eq!(cache.get(&new_key).await.unwrap().as_deref(), Some("new"));
}

#[tokio::test]
async fn sqlite_cache_prune_by_age_drops_stale_rows() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCallCache::new(&db_path).unwrap();

    let stale = key_for("- stale");
    let fresh = key_for("- fresh");
    cache.put(&stale, "stale").await.unwrap();
    cache.put(&fresh, "fresh").await.unwrap();

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "UPDATE model_calls SET updated_at = 0 WHERE key_hash = ?1",
        rusqlite::params![stale.key_hash],
    )
    .unwrap();

    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.remaining, 1);
    assert!(cache.get(&fresh).await.unwrap().is_some());
}

#[test]
fn sqlite_cache_lock_does_not_truncate_lockfile() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteCallCache::new(&db_path).unwrap();

    let mut lock_path = db_path.clone();
    lock_path.set_extension("lock");
    std::fs::write(&lock_path, "keep").unwrap();

    let lock = cache.lock_exclusive().unwrap();
    drop(lock);

    let contents = std::fs::read_to_string(&lock_path).unwrap();
    assert_eq!(contents, "keep");
}
