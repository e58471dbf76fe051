use filecache_test as test;

use crate::{random_source_file, setup_cache, sha256_file};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_file_round_trip() {
    let test = setup_cache(|_| {}).await;
    let hash = random_source_file(&test, "large.bin", 32 * 1024 * 1024 + 17);

    test.cache.store("large.bin").await.unwrap();
    std::fs::remove_file(test.source_path("large.bin")).unwrap();

    let dest = test.out_path("large.bin");
    test.cache.fetch("large.bin", &test.out, &dest).await.unwrap();
    assert_eq!(sha256_file(&dest), hash);

    // fetching again yields the same content
    let again = test.out_path("again.bin");
    test.cache.fetch("large.bin", &test.out, &again).await.unwrap();
    assert_eq!(sha256_file(&again), hash);
}

#[tokio::test]
async fn test_tree_round_trip() {
    let cache = setup_cache(|_| {}).await;
    let root = cache.source_path("tree");
    test::random_file(root.join("a.bin"), 100_000);
    test::random_file(root.join("nested/b.bin"), 1);
    test::write_file(root.join("nested/deeper/empty"), b"");
    let hash = test::sha256_tree(&root);

    cache.cache.store("tree").await.unwrap();
    std::fs::remove_dir_all(&root).unwrap();

    let dest = cache.out_path("tree");
    cache.cache.fetch("tree", &cache.out, &dest).await.unwrap();
    assert_eq!(test::sha256_tree(&dest), hash);
}
