use std::time::Duration;

use filecache::CacheError;

use crate::{setup_cache, source_file};

#[tokio::test]
async fn test_store_rejects_duplicate_keys() {
    let test = setup_cache(|_| {}).await;
    let cache = &test.cache;
    for key in ["one", "two", "nested/three"] {
        source_file(&test, key, key.as_bytes());
    }

    for key in ["one", "two", "nested/three"] {
        cache.store(key).await.unwrap();
        assert_eq!(cache.store(key).await, Err(CacheError::AlreadyExists));
        assert_eq!(
            cache.store_with_ttl(key, Duration::from_secs(5)).await,
            Err(CacheError::AlreadyExists)
        );
    }
    assert_eq!(cache.len(), 3);
    assert_eq!(test.stored_artifacts(), 3);

    // storing again is allowed after an evict
    cache.evict("one").await.unwrap();
    cache.store("one").await.unwrap();
    assert_eq!(test.stored_artifacts(), 3);
}

#[tokio::test]
async fn test_closed_cache_rejects_operations() {
    let test = setup_cache(|_| {}).await;
    let cache = &test.cache;
    source_file(&test, "stored", b"stored");
    source_file(&test, "new", b"new");
    cache.store("stored").await.unwrap();

    cache.close().await.unwrap();
    assert_eq!(test.stored_artifacts(), 0);

    let dest = test.out_path("stored");
    assert_eq!(cache.store("new").await, Err(CacheError::Conflict));
    assert_eq!(
        cache.store_with_ttl("new", Duration::from_secs(1)).await,
        Err(CacheError::Conflict)
    );
    assert_eq!(cache.evict("stored").await, Err(CacheError::Conflict));
    assert_eq!(cache.has("stored").await, Err(CacheError::Conflict));
    assert_eq!(
        cache.fetch("stored", &test.out, &dest).await,
        Err(CacheError::Conflict)
    );
    assert!(!dest.exists());

    cache.close().await.unwrap();
}

#[tokio::test]
async fn test_evict_unknown_key() {
    let test = setup_cache(|_| {}).await;
    let cache = &test.cache;
    source_file(&test, "kept", b"kept");
    cache.store("kept").await.unwrap();

    cache.evict("unknown").await.unwrap();
    cache.evict("unknown").await.unwrap();

    assert_eq!(cache.len(), 1);
    assert!(cache.has("kept").await.unwrap());
    assert!(!cache.has("unknown").await.unwrap());
    assert_eq!(test.stored_artifacts(), 1);
}

#[tokio::test]
async fn test_store_propagates_source_errors() {
    let test = setup_cache(|_| {}).await;
    let cache = &test.cache;

    assert_eq!(cache.store("missing").await, Err(CacheError::NotFound));
    assert!(matches!(
        cache.store("../escape").await,
        Err(CacheError::Invalid(_))
    ));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_close_with_read_only_content() {
    let test = setup_cache(|_| {}).await;
    let cache = &test.cache;
    source_file(&test, "tree/a", b"a");
    source_file(&test, "tree/sub/b", b"b");
    cache.store("tree").await.unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let entries = test.tempdir.path().join("cache/entries");
        let stored = std::fs::read_dir(&entries).unwrap().next().unwrap().unwrap();
        for dir in [stored.path().join("sub"), stored.path()] {
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o500)).unwrap();
        }
    }

    cache.close().await.unwrap();
    assert_eq!(test.stored_artifacts(), 0);
}
