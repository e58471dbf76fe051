use std::time::Duration;

use crate::{setup_cache, source_file};

#[tokio::test]
async fn test_fetch_renews_ttl() {
    let test = setup_cache(|config| {
        config.ttl = Duration::from_secs(2);
    })
    .await;
    let cache = &test.cache;
    source_file(&test, "hot", b"hot");
    source_file(&test, "cold", b"cold");

    cache.store("hot").await.unwrap();
    cache.store("cold").await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    cache
        .fetch("hot", &test.out, &test.out_path("hot"))
        .await
        .unwrap();

    // `cold` is expired by now, `hot` has most of its renewed lifetime left
    tokio::time::sleep(Duration::from_millis(1200)).await;
    cache.gc().await;

    assert!(cache.has("hot").await.unwrap());
    assert!(!cache.has("cold").await.unwrap());
    assert_eq!(test.stored_artifacts(), 1);
}

#[tokio::test]
async fn test_gc_reclaims_expired_entries() {
    let test = setup_cache(|config| {
        config.ttl = Duration::from_millis(200);
        config.gc_period = Duration::from_millis(200);
    })
    .await;
    let cache = &test.cache;
    for key in ["first", "second", "long-lived"] {
        source_file(&test, key, key.as_bytes());
    }

    cache.store("first").await.unwrap();
    cache.store("second").await.unwrap();
    cache
        .store_with_ttl("long-lived", Duration::from_secs(60))
        .await
        .unwrap();

    // several periodic sweeps, without any call to `gc`
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!cache.has("first").await.unwrap());
    assert!(!cache.has("second").await.unwrap());
    assert!(cache.has("long-lived").await.unwrap());
    assert_eq!(test.stored_artifacts(), 1);
}

#[tokio::test]
async fn test_expired_entry_is_fetchable_until_collected() {
    let test = setup_cache(|config| {
        config.ttl = Duration::from_millis(500);
    })
    .await;
    let cache = &test.cache;
    source_file(&test, "entry", b"entry");
    cache.store("entry").await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    // expired, but the sweep has not run yet
    let dest = test.out_path("entry");
    cache.fetch("entry", &test.out, &dest).await.unwrap();

    // the fetch renewed it
    cache.gc().await;
    assert!(cache.has("entry").await.unwrap());
}
