//! In-process KV/pub-sub implementation.
//!
//! Used as the default backend for tests and as the storage medium for the
//! resilience layer's local fallback queue. Structurally mirrors the
//! teacher's `InMemoryCache` (moka + dashmap) but needs the richer
//! hash/set/zset/pub-sub surface the KV Adapter trait requires, so it is
//! built directly on `dashmap::DashMap` rather than a cache crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use super::backend::{KvAdapter, KvMessage, KvSubscription};
use super::error::KvError;
use super::glob::glob_match;

#[derive(Clone)]
enum StoredValue {
    Str(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    Set(std::collections::HashSet<String>),
    ZSet(Vec<(String, f64)>),
}

const BROADCAST_CAPACITY: usize = 4096;

pub struct MemoryKv {
    values: DashMap<String, StoredValue>,
    expirations: DashMap<String, Instant>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    /// Registered pattern subscriptions, consulted on every publish.
    pattern_channels: Arc<RwLock<Vec<(String, broadcast::Sender<Vec<u8>>)>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            expirations: DashMap::new(),
            channels: DashMap::new(),
            pattern_channels: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn evict_if_expired(&self, key: &str) {
        if let Some(exp) = self.expirations.get(key)
            && Instant::now() >= *exp
        {
            drop(exp);
            self.values.remove(key);
            self.expirations.remove(key);
        }
    }

    fn channel_sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(BROADCAST_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

struct FanInSubscription {
    rx: mpsc::UnboundedReceiver<KvMessage>,
    _handles: Vec<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl KvSubscription for FanInSubscription {
    async fn recv(&mut self) -> Result<Option<KvMessage>, KvError> {
        Ok(self.rx.recv().await)
    }
}

fn spawn_forwarders(
    senders: Vec<(String, broadcast::Sender<Vec<u8>>)>,
) -> (mpsc::UnboundedReceiver<KvMessage>, Vec<tokio::task::JoinHandle<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut handles = Vec::with_capacity(senders.len());
    for (channel, sender) in senders {
        let mut receiver = sender.subscribe();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => {
                        if tx
                            .send(KvMessage {
                                channel: channel.clone(),
                                payload,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
    (rx, handles)
}

#[async_trait]
impl KvAdapter for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.evict_if_expired(key);
        Ok(self.values.get(key).and_then(|v| match &*v {
            StoredValue::Str(b) => Some(b.clone()),
            _ => None,
        }))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        self.values.insert(key.to_string(), StoredValue::Str(value));
        match ttl {
            Some(d) => {
                self.expirations.insert(key.to_string(), Instant::now() + d);
            }
            None => {
                self.expirations.remove(key);
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        self.expirations.remove(key);
        Ok(self.values.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        self.evict_if_expired(key);
        Ok(self.values.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        if !self.values.contains_key(key) {
            return Ok(false);
        }
        self.expirations.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .expirations
            .get(key)
            .map(|exp| exp.saturating_duration_since(Instant::now())))
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.evict_if_expired(key);
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::Hash(HashMap::new()));
        match &mut *entry {
            StoredValue::Hash(h) => {
                h.insert(field.to_string(), value);
                Ok(())
            }
            _ => Err(KvError::Operation(format!("key '{key}' is not a hash"))),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.evict_if_expired(key);
        Ok(self.values.get(key).and_then(|v| match &*v {
            StoredValue::Hash(h) => h.get(field).cloned(),
            _ => None,
        }))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .values
            .get(key)
            .map(|v| match &*v {
                StoredValue::Hash(h) => h.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .values
            .get_mut(key)
            .map(|mut v| match &mut *v {
                StoredValue::Hash(h) => h.remove(field).is_some(),
                _ => false,
            })
            .unwrap_or(false))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.evict_if_expired(key);
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::Set(Default::default()));
        match &mut *entry {
            StoredValue::Set(s) => Ok(s.insert(member.to_string())),
            _ => Err(KvError::Operation(format!("key '{key}' is not a set"))),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .values
            .get(key)
            .map(|v| match &*v {
                StoredValue::Set(s) => s.iter().cloned().collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .values
            .get_mut(key)
            .map(|mut v| match &mut *v {
                StoredValue::Set(s) => s.remove(member),
                _ => false,
            })
            .unwrap_or(false))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .values
            .get(key)
            .map(|v| match &*v {
                StoredValue::Set(s) => s.contains(member),
                _ => false,
            })
            .unwrap_or(false))
    }

    async fn scard(&self, key: &str) -> Result<u64, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .values
            .get(key)
            .map(|v| match &*v {
                StoredValue::Set(s) => s.len() as u64,
                _ => 0,
            })
            .unwrap_or(0))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        self.evict_if_expired(key);
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::ZSet(Vec::new()));
        match &mut *entry {
            StoredValue::ZSet(z) => {
                z.retain(|(m, _)| m != member);
                let pos = z.partition_point(|(_, s)| *s < score);
                z.insert(pos, (member.to_string(), score));
                Ok(())
            }
            _ => Err(KvError::Operation(format!("key '{key}' is not a zset"))),
        }
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, KvError> {
        self.evict_if_expired(key);
        let z = self.zset_snapshot(key);
        Ok(slice_by_rank(&z, start, stop))
    }

    async fn zrevrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, KvError> {
        self.evict_if_expired(key);
        let mut z = self.zset_snapshot(key);
        z.reverse();
        Ok(slice_by_rank(&z, start, stop))
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .zset_snapshot(key)
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.evict_if_expired(key);
        Ok(self
            .values
            .get_mut(key)
            .map(|mut v| match &mut *v {
                StoredValue::ZSet(z) => {
                    let before = z.len();
                    z.retain(|(m, _)| m != member);
                    z.len() != before
                }
                _ => false,
            })
            .unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        self.evict_if_expired(key);
        Ok(self.zset_snapshot(key).len() as u64)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .values
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| glob_match(pattern, k))
            .collect())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<u64, KvError> {
        let mut count = 0u64;
        if let Some(sender) = self.channels.get(channel) {
            count += sender.send(payload.clone()).unwrap_or(0) as u64;
        }
        for (pattern, sender) in self.pattern_channels.read().iter() {
            if glob_match(pattern, channel) {
                count += sender.send(payload.clone()).unwrap_or(0) as u64;
            }
        }
        Ok(count)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn KvSubscription>, KvError> {
        let senders = channels
            .iter()
            .map(|c| (c.clone(), self.channel_sender(c)))
            .collect();
        let (rx, handles) = spawn_forwarders(senders);
        Ok(Box::new(FanInSubscription {
            rx,
            _handles: handles,
        }))
    }

    async fn psubscribe(&self, patterns: &[String]) -> Result<Box<dyn KvSubscription>, KvError> {
        let mut senders = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
            self.pattern_channels
                .write()
                .push((pattern.clone(), tx.clone()));
            senders.push((pattern.clone(), tx));
        }
        let (rx, handles) = spawn_forwarders(senders);
        Ok(Box::new(FanInSubscription {
            rx,
            _handles: handles,
        }))
    }
}

impl MemoryKv {
    fn zset_snapshot(&self, key: &str) -> Vec<(String, f64)> {
        self.values
            .get(key)
            .map(|v| match &*v {
                StoredValue::ZSet(z) => z.clone(),
                _ => Vec::new(),
            })
            .unwrap_or_default()
    }
}

fn slice_by_rank(z: &[(String, f64)], start: i64, stop: i64) -> Vec<(String, f64)> {
    let len = z.len() as i64;
    if len == 0 {
        return Vec::new();
    }
    let norm = |i: i64| -> i64 {
        if i < 0 { (len + i).max(0) } else { i.min(len - 1) }
    };
    let start = norm(start);
    let stop = norm(stop);
    if start > stop {
        return Vec::new();
    }
    z[start as usize..=stop as usize].to_vec()
}
