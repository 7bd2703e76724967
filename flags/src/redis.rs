use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

// average for all commands is <10ms, leave headroom for slow networks
const REDIS_TIMEOUT_MILLISECS: u64 = 100;

#[derive(Error, Debug)]
pub enum CustomRedisError {
    #[error("not found in redis")]
    NotFound,
    #[error("redis timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("redis error: {0}")]
    Other(#[from] redis::RedisError),
}

/// A simple redis wrapper. Every command is bounded by a timeout so a slow
/// cache can never hold up a request handler.
#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set(
        &self,
        k: String,
        v: String,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    async fn publish(&self, channel: String, message: String) -> Result<(), CustomRedisError>;
}

pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.get::<_, Option<String>>(k);
        let value = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        match value {
            Some(value) => Ok(value),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn set(
        &self,
        k: String,
        v: String,
        ttl_seconds: Option<u64>,
    ) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        match ttl_seconds {
            Some(secs) => {
                let results = conn.set_ex::<_, _, ()>(k, v, secs as usize);
                timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;
            }
            None => {
                let results = conn.set::<_, _, ()>(k, v);
                timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;
            }
        }

        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.del::<_, ()>(k);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        Ok(())
    }

    async fn publish(&self, channel: String, message: String) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_async_connection().await?;

        let results = conn.publish::<_, _, ()>(channel, message);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results).await??;

        Ok(())
    }
}

/// In-memory stand-in for tests. Stores entries in a map, records published
/// messages, and can be flipped into a failing state to exercise the
/// cache-unavailable paths.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, String>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
    broken: Arc<Mutex<bool>>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        Default::default()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn contains(&self, k: &str) -> bool {
        self.entries.lock().unwrap().contains_key(k)
    }

    pub fn insert_raw(&self, k: String, v: String) {
        self.entries.lock().unwrap().insert(k, v);
    }

    pub fn set_broken(&self, broken: bool) {
        *self.broken.lock().unwrap() = broken;
    }

    fn check_connection(&self) -> Result<(), CustomRedisError> {
        if *self.broken.lock().unwrap() {
            return Err(CustomRedisError::Other(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "mock connection refused",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        self.check_connection()?;
        match self.entries.lock().unwrap().get(&k) {
            Some(value) => Ok(value.clone()),
            None => Err(CustomRedisError::NotFound),
        }
    }

    async fn set(
        &self,
        k: String,
        v: String,
        _ttl_seconds: Option<u64>,
    ) -> Result<(), CustomRedisError> {
        self.check_connection()?;
        self.entries.lock().unwrap().insert(k, v);
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        self.check_connection()?;
        self.entries.lock().unwrap().remove(&k);
        Ok(())
    }

    async fn publish(&self, channel: String, message: String) -> Result<(), CustomRedisError> {
        self.check_connection()?;
        self.published.lock().unwrap().push((channel, message));
        Ok(())
    }
}
