use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::sync::Arc;
use tracing;

use crate::config::{mask_credentials, RedisConfig};
use crate::error::PulseResult;

pub type RedisPool = Arc<Client>;
pub type RedisConnection = MultiplexedConnection;

/// One shared client per instance. Presence commands and bus publishes run
/// over multiplexed connections from this client; the bus subscriber opens
/// its own dedicated connection (see `bus::subscribe`).
pub async fn connect(config: &RedisConfig) -> Result<RedisPool> {
    tracing::info!("Connecting to Redis {}", mask_credentials(&config.url));

    let client =
        Client::open(config.url.as_str()).map_err(|e| anyhow!("invalid Redis URL: {}", e))?;

    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| anyhow!("Redis unreachable: {}", e))?;
    redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .map_err(|e| anyhow!("Redis ping failed: {}", e))?;

    tracing::info!("Redis reachable");

    Ok(Arc::new(client))
}

pub async fn get_connection(pool: &RedisPool) -> PulseResult<RedisConnection> {
    Ok(pool.get_multiplexed_async_connection().await?)
}
