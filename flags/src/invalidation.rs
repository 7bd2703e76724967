use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;

use crate::cache::{FlagCache, FLAG_UPDATES_CHANNEL};

/// Subscribes to the invalidation channel and drops the cached entry for
/// every announced key, so the next read on this instance misses and
/// reloads from the store.
///
/// Runs for the life of the process, reconnecting with a small delay when
/// the subscription drops. Owns its own connection: redis pub/sub takes the
/// connection over, so this can't sit behind the command `Client` trait.
pub async fn run_invalidation_listener(redis_url: String, cache: FlagCache) {
    loop {
        if let Err(e) = listen(&redis_url, &cache).await {
            tracing::error!("invalidation listener disconnected: {}", e);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn listen(redis_url: &str, cache: &FlagCache) -> Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_connection().await?.into_pubsub();
    pubsub.subscribe(FLAG_UPDATES_CHANNEL).await?;
    tracing::info!("subscribed to {}", FLAG_UPDATES_CHANNEL);

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let key: String = match message.get_payload() {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("ignoring malformed invalidation message: {}", e);
                continue;
            }
        };

        tracing::debug!("dropping cached flag {} after invalidation event", key);
        cache.invalidate(&key).await;
    }

    Ok(())
}
