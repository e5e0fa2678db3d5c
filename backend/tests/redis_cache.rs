use testcontainers::{clients::Cli, core::WaitFor, GenericImage, RunnableImage};
use sessionkeeper_backend::{
    db::redis::create_redis_pool,
    persistence::{kinds, partitions, redis::RedisCache, CacheBackend, StoredEntry},
};

mod support;

#[tokio::test]
#[ignore = "requires a container runtime"]
async fn redis_cache_roundtrip() {
    let docker = Cli::default();
    let host_port = support::allocate_ephemeral_port();
    let image = GenericImage::new("redis", "7-alpine")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    let image = RunnableImage::from(image).with_mapped_port((host_port, 6379));
    let _container = docker.run(image);

    let mut config = support::test_config();
    config.redis_url = Some(format!("redis://127.0.0.1:{host_port}"));

    let pool = create_redis_pool(&config)
        .await
        .expect("create redis pool")
        .expect("redis pool available");
    let cache = RedisCache::new(pool);

    let entry = StoredEntry::encode(
        partitions::TOKENS,
        kinds::TOKEN,
        "code-hash",
        &serde_json::json!({ "grant_id": "g-1" }),
    )
    .expect("encode");
    let key = entry.cache_key();

    cache.put(&key, &entry, 60).await.expect("put");
    let cached = cache.get(&key).await.expect("get").expect("cached");
    assert_eq!(cached, entry);

    cache.remove(&key).await.expect("remove");
    assert!(cache.get(&key).await.expect("get").is_none());

    cache.put(&key, &entry, 0).await.expect("put without ttl");
    assert!(cache.get(&key).await.expect("get").is_none());
    assert_eq!(cache.cleanup_expired().await.expect("cleanup"), 0);
}
