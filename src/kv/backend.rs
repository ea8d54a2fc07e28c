//! The abstract KV/pub-sub interface the core consumes (§4.A).
//!
//! The choice of backing store is explicitly out of scope for this crate;
//! this trait is the seam. Two implementations ship: `MemoryKv` (the
//! default, used by the resilience layer's local fallback and by tests)
//! and `RedisKv` (a reference adapter over `deadpool-redis`).

use std::time::Duration;

use async_trait::async_trait;

use super::error::KvError;

/// A message received from a subscribed channel or pattern.
#[derive(Debug, Clone)]
pub struct KvMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// A live subscription to one or more exact channels and/or glob patterns.
#[async_trait]
pub trait KvSubscription: Send {
    /// Await the next message. Returns `Ok(None)` when the subscription was
    /// explicitly closed.
    async fn recv(&mut self) -> Result<Option<KvMessage>, KvError>;
}

#[async_trait]
pub trait KvAdapter: Send + Sync {
    // -- string ops --------------------------------------------------
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;
    async fn del(&self, key: &str) -> Result<bool, KvError>;
    async fn exists(&self, key: &str) -> Result<bool, KvError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    // -- hash ops -----------------------------------------------------
    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;

    // -- set ops --------------------------------------------------------
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn scard(&self, key: &str) -> Result<u64, KvError>;

    // -- sorted-set ops ---------------------------------------------------
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;
    /// Inclusive range by rank, ascending score. `-1` as `stop` means "to the end".
    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, KvError>;
    /// Inclusive range by rank, descending score.
    async fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, KvError>;
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, KvError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn zcard(&self, key: &str) -> Result<u64, KvError>;

    // -- key scan ---------------------------------------------------------
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    // -- pub/sub ------------------------------------------------------
    /// Publish and return the number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64, KvError>;
    /// Subscribe to exact channel names.
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn KvSubscription>, KvError>;
    /// Subscribe to glob patterns (e.g. `mailbox:*`).
    async fn psubscribe(&self, patterns: &[String]) -> Result<Box<dyn KvSubscription>, KvError>;
}
