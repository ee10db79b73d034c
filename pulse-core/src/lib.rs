pub mod bus;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod presence;
pub mod redis;
pub mod schema;
pub mod storage;
pub mod types;

pub use config::Config;
pub use context::PulseContext;
pub use db::DbPool;
pub use error::{PulseError, PulseResult};
pub use redis::RedisPool;
pub use storage::StorageClient;
