use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::audit::PostgresAuditRecorder;
use crate::cache::FlagCache;
use crate::config::Config;
use crate::invalidation;
use crate::redis::RedisClient;
use crate::router;
use crate::store::PostgresFlagStore;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let redis_client =
        Arc::new(RedisClient::new(config.redis_url.clone()).expect("failed to create redis client"));

    let store = PostgresFlagStore::new(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to initialize flag store");
    let audit = PostgresAuditRecorder::new(store.pool().clone());
    let cache = FlagCache::new(redis_client, config.cache_ttl_seconds);

    // Each instance drops its cached entries when another instance announces
    // a mutation.
    tokio::spawn(invalidation::run_invalidation_listener(
        config.redis_url.clone(),
        cache.clone(),
    ));

    let app = router::router(store, cache, audit, config.export_prometheus);

    tracing::info!(
        "listening on {:?}",
        listener.local_addr().expect("failed to read local address")
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("server exited with an error")
}
