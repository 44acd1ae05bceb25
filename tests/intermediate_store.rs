use std::time::Duration;

use recap_harness::store::{
    get_json, put_json, IntermediateStore, MemoryIntermediateStore, SqliteIntermediateStore,
    StoreKey,
};
use tempfile::tempdir;

const DAY: Duration = Duration::from_secs(86_400);

#[tokio::test]
async fn sqlite_put_overwrites_and_counts_writes() {
    let dir = tempdir().unwrap();
    let store = SqliteIntermediateStore::new(dir.path().join("store.sqlite")).unwrap();
    let key = StoreKey::session_data(1, "sess-a", "ctx");

    store.put(&key, b"first".to_vec(), DAY).await.unwrap();
    store.put(&key, b"second".to_vec(), DAY).await.unwrap();

    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(&b"second"[..]));
    assert_eq!(store.write_count(&key).await.unwrap(), Some(2));
    assert_eq!(
        store
            .write_count(&StoreKey::session_data(1, "sess-b", "ctx"))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn sqlite_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.sqlite");
    let key = StoreKey::phase("ex1", "extracting_patterns", "chunk-0");
    {
        let store = SqliteIntermediateStore::new(&path).unwrap();
        put_json(&store, &key, &vec!["a", "b"], DAY).await.unwrap();
    }
    let store = SqliteIntermediateStore::new(&path).unwrap();
    let value: Option<Vec<String>> = get_json(&store, &key).await.unwrap();
    assert_eq!(value, Some(vec!["a".to_string(), "b".to_string()]));
}

#[tokio::test]
async fn sqlite_expired_entries_are_invisible_and_pruned() {
    let dir = tempdir().unwrap();
    let store = SqliteIntermediateStore::new(dir.path().join("store.sqlite")).unwrap();
    let stale = StoreKey::session_summary(1, "old", "ctx");
    let live = StoreKey::session_summary(1, "new", "ctx");

    store.put(&stale, b"x".to_vec(), Duration::ZERO).await.unwrap();
    store.put(&live, b"y".to_vec(), DAY).await.unwrap();

    assert!(store.get(&stale).await.unwrap().is_none());
    assert!(!store.delete(&stale).await.unwrap());

    store.put(&stale, b"x".to_vec(), Duration::ZERO).await.unwrap();
    let _lock = store.lock_exclusive().unwrap();
    let stats = store.prune_expired().await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert_eq!(stats.remaining, 1);
}

#[tokio::test]
async fn sqlite_delete_reports_removal() {
    let dir = tempdir().unwrap();
    let store = SqliteIntermediateStore::new(dir.path().join("store.sqlite")).unwrap();
    let key = StoreKey::phase("ex1", "chunking", "plan");

    store.put(&key, b"plan".to_vec(), DAY).await.unwrap();
    assert!(store.delete(&key).await.unwrap());
    assert!(!store.delete(&key).await.unwrap());
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn memory_store_matches_sqlite_semantics() {
    let store = MemoryIntermediateStore::new();
    let key = StoreKey::phase("ex1", "assigning_events", "chunk-1");

    store.put(&key, b"1".to_vec(), DAY).await.unwrap();
    store.put(&key, b"2".to_vec(), DAY).await.unwrap();
    store
        .put(&StoreKey::phase("ex1", "assigning_events", "chunk-0"), b"0".to_vec(), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some(&b"2"[..]));
    assert_eq!(store.write_count(&key), Some(2));
    assert_eq!(store.keys(), vec![key.clone()]);
    assert!(store.delete(&key).await.unwrap());
    assert!(store.keys().is_empty());
}
