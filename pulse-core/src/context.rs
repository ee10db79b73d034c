use std::sync::Arc;

use crate::config::Config;
use crate::db::{self, DbPool};
use crate::redis::{self, RedisPool};
use crate::storage::StorageClient;

/// Shared handles cloned into every handler, socket task, and consumer.
#[derive(Clone)]
pub struct PulseContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
    pub redis_pool: RedisPool,
    pub storage: StorageClient,
}

impl PulseContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = db::connect(&config.database).await?;
        let redis_pool = redis::connect(&config.redis).await?;
        let storage = StorageClient::new(&config.storage)?;

        Ok(PulseContext {
            config: Arc::new(config),
            db_pool,
            redis_pool,
            storage,
        })
    }
}
