//! KV adapter error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv connection error: {0}")]
    Connection(String),

    #[error("kv operation failed: {0}")]
    Operation(String),

    #[error("kv call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("pub/sub channel closed")]
    ChannelClosed,
}

impl From<deadpool_redis::redis::RedisError> for KvError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        KvError::Operation(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for KvError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        KvError::Connection(e.to_string())
    }
}
