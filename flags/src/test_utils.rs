use std::sync::Arc;

use axum::Router;
use rand::{distributions::Alphanumeric, Rng};

use crate::audit::MemoryAuditRecorder;
use crate::cache::FlagCache;
use crate::redis::MockRedisClient;
use crate::router;
use crate::store::MemoryFlagStore;

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// A router over fully in-memory collaborators, with handles kept so tests
/// can assert on the store, cache, and audit trail behind it.
pub struct TestApp {
    pub router: Router,
    pub store: MemoryFlagStore,
    pub redis: MockRedisClient,
    pub audit: MemoryAuditRecorder,
}

pub fn setup_test_app() -> TestApp {
    let store = MemoryFlagStore::new();
    let redis = MockRedisClient::new();
    let audit = MemoryAuditRecorder::new();
    let cache = FlagCache::new(Arc::new(redis.clone()), 60);

    let router = router::router(store.clone(), cache, audit.clone(), false);

    TestApp {
        router,
        store,
        redis,
        audit,
    }
}
