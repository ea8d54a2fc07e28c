//! Redis-backed `KvAdapter`, the reference implementation for production
//! deployments. Built on `deadpool-redis`.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::AsyncCommands;
use tokio::sync::mpsc;

use super::backend::{KvAdapter, KvMessage, KvSubscription};
use super::error::KvError;

pub struct RedisKv {
    pool: Pool,
    /// Kept alongside the pool because pub/sub needs dedicated connections,
    /// not pooled ones.
    redis_url: String,
}

impl RedisKv {
    pub fn new(pool: Pool, redis_url: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
        }
    }

    async fn dedicated_client(&self) -> Result<deadpool_redis::redis::Client, KvError> {
        deadpool_redis::redis::Client::open(self.redis_url.as_str())
            .map_err(|e| KvError::Connection(e.to_string()))
    }
}

struct RedisSubscription {
    rx: mpsc::UnboundedReceiver<KvMessage>,
    _handle: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl KvSubscription for RedisSubscription {
    async fn recv(&mut self) -> Result<Option<KvMessage>, KvError> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl KvAdapter for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.pool.get().await?;
        match ttl {
            Some(d) => {
                let _: () = conn.set_ex(key, value, d.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = conn.del(key).await?;
        Ok(n > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.expire(key, ttl.as_secs().max(1) as i64).await?)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut conn = self.pool.get().await?;
        let secs: i64 = conn.ttl(key).await?;
        Ok(if secs >= 0 {
            Some(Duration::from_secs(secs as u64))
        } else {
            None
        })
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let mut conn = self.pool.get().await?;
        let map: std::collections::HashMap<String, Vec<u8>> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = conn.hdel(key, field).await?;
        Ok(n > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = conn.sadd(key, member).await?;
        Ok(n > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.smembers(key).await?)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = conn.srem(key, member).await?;
        Ok(n > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.sismember(key, member).await?)
    }

    async fn scard(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.scard(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zrange_withscores(key, start as isize, stop as isize).await?)
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn
            .zrevrange_withscores(key, start as isize, stop as isize)
            .await?)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zrangebyscore_withscores(key, min, max).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut conn = self.pool.get().await?;
        let n: i64 = conn.zrem(key, member).await?;
        Ok(n > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.zcard(key).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.keys(pattern).await?)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64, KvError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.publish(channel, payload).await?)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn KvSubscription>, KvError> {
        let client = self.dedicated_client().await?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        for channel in channels {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| KvError::Operation(e.to_string()))?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel: String = msg.get_channel_name().to_string();
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send(KvMessage { channel, payload }).is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(RedisSubscription { rx, _handle: handle }))
    }

    async fn psubscribe(&self, patterns: &[String]) -> Result<Box<dyn KvSubscription>, KvError> {
        let client = self.dedicated_client().await?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))?;
        for pattern in patterns {
            pubsub
                .psubscribe(pattern)
                .await
                .map_err(|e| KvError::Operation(e.to_string()))?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel: String = msg.get_channel_name().to_string();
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send(KvMessage { channel, payload }).is_err() {
                    break;
                }
            }
        });
        Ok(Box::new(RedisSubscription { rx, _handle: handle }))
    }
}
