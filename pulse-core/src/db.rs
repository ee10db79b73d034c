use anyhow::{anyhow, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::config::{mask_credentials, DatabaseConfig};

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

const CONNECT_ATTEMPTS: u32 = 5;
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds the per-instance pool and probes it before the gateway starts
/// accepting connections. A cold Postgres (fresh container, failover) can
/// take a few seconds to come up, so the probe backs off instead of failing
/// the boot on the first refusal.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!(
        "Connecting to database {} (pool size {})",
        mask_credentials(&config.url),
        config.max_connections
    );

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .map_err(|e| anyhow!("failed to build database pool: {}", e))?;

    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio::time::timeout(PROBE_TIMEOUT, pool.get()).await {
            Ok(Ok(_conn)) => {
                tracing::info!("Database reachable after {} attempt(s)", attempt);
                return Ok(Arc::new(pool));
            }
            Ok(Err(e)) => {
                tracing::warn!("Database probe {} of {} failed: {}", attempt, CONNECT_ATTEMPTS, e);
            }
            Err(_) => {
                tracing::warn!(
                    "Database probe {} of {} timed out after {:?}",
                    attempt,
                    CONNECT_ATTEMPTS,
                    PROBE_TIMEOUT
                );
            }
        }

        if attempt < CONNECT_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
        }
    }

    Err(anyhow!(
        "database unreachable after {} attempts",
        CONNECT_ATTEMPTS
    ))
}
