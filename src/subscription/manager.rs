//! Subscription Manager (§4.H): owns the in-memory subscription indices,
//! per-agent connection state, and the realtime/batch/polling dispatch
//! fan-out used by Real-Time Delivery.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::component::{Component, ComponentStatus};
use crate::error::{MailboxError, Result};
use crate::kv::KvAdapter;
use crate::model::{ConnectionState, DeliveryMode, Message, Subscription, SubscriptionOptions};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_OFFLINE_TIMEOUT: Duration = Duration::from_secs(24 * 3600);
pub const SUBSCRIPTION_IDLE_TTL: chrono::Duration = chrono::Duration::hours(24);

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type Handler = Arc<dyn Fn(Message, Subscription) -> HandlerFuture + Send + Sync>;

/// Per-agent rate-limiting hook (§10 supplement), consulted before REALTIME
/// dispatch. No-op by default; enforcement policy itself is the gateway's
/// job, this is only the extension point.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, agent_id: &str) -> bool;
}

pub struct AllowAllRateLimiter;

#[async_trait]
impl RateLimiter for AllowAllRateLimiter {
    async fn allow(&self, _agent_id: &str) -> bool {
        true
    }
}

fn subscription_key(id: &str) -> String {
    format!("subscription:{id}")
}

pub struct SubscriptionManager {
    kv: Arc<dyn KvAdapter>,
    sub_by_id: DashMap<String, Subscription>,
    subs_by_agent: DashMap<String, HashSet<String>>,
    subs_by_target_or_pattern: DashMap<String, HashSet<String>>,
    conn_by_agent: DashMap<String, ConnectionState>,
    handler_by_agent: Arc<DashMap<String, Handler>>,
    adapter_subs: DashMap<String, JoinHandle<()>>,
    heartbeat_interval: Duration,
    offline_timeout: Duration,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl SubscriptionManager {
    pub fn new(kv: Arc<dyn KvAdapter>) -> Self {
        Self {
            kv,
            sub_by_id: DashMap::new(),
            subs_by_agent: DashMap::new(),
            subs_by_target_or_pattern: DashMap::new(),
            conn_by_agent: DashMap::new(),
            handler_by_agent: Arc::new(DashMap::new()),
            adapter_subs: DashMap::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            offline_timeout: DEFAULT_OFFLINE_TIMEOUT,
            rate_limiter: Arc::new(AllowAllRateLimiter),
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Every agent with at least one subscription ever registered, used by
    /// the offline-queue cleanup loop to know which per-agent queues to
    /// sweep.
    pub fn known_agents(&self) -> Vec<String> {
        self.subs_by_agent.iter().map(|e| e.key().clone()).collect()
    }

    pub fn register_handler(&self, agent_id: &str, handler: Handler) {
        self.handler_by_agent.insert(agent_id.to_string(), handler);
    }

    pub fn unregister_handler(&self, agent_id: &str) {
        self.handler_by_agent.remove(agent_id);
    }

    pub fn has_handler(&self, agent_id: &str) -> bool {
        self.handler_by_agent.contains_key(agent_id)
    }

    /// Invokes `agent_id`'s registered handler directly, bypassing
    /// subscription matching. Used to replay durably-queued offline
    /// messages once a handler shows up. `None` if no handler is
    /// registered.
    pub async fn invoke_handler(&self, agent_id: &str, msg: &Message, sub: &Subscription) -> Option<Result<()>> {
        let handler = self.handler_by_agent.get(agent_id)?.clone();
        Some(handler(msg.clone(), sub.clone()).await)
    }

    fn index_key(target: &str, pattern: Option<&str>) -> String {
        pattern.unwrap_or(target).to_string()
    }

    /// Validates, deduplicates on `(agent_id, target, pattern)`, registers a
    /// live KV subscription to feed external consumers, and persists the
    /// record.
    pub async fn create_subscription(
        &self,
        agent_id: &str,
        target: &str,
        pattern: Option<String>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        crate::model::validate_agent_id(agent_id)?;
        crate::model::validate_target(target)?;

        if let Some(existing_ids) = self.subs_by_agent.get(agent_id) {
            for id in existing_ids.iter() {
                if let Some(sub) = self.sub_by_id.get(id)
                    && sub.target == target
                    && sub.pattern == pattern
                {
                    return Ok(sub.clone());
                }
            }
        }

        let sub = Subscription::new(agent_id, target, pattern.clone(), options);
        self.persist(&sub).await?;

        self.sub_by_id.insert(sub.id.to_string(), sub.clone());
        self.subs_by_agent
            .entry(agent_id.to_string())
            .or_default()
            .insert(sub.id.to_string());
        self.subs_by_target_or_pattern
            .entry(Self::index_key(target, pattern.as_deref()))
            .or_default()
            .insert(sub.id.to_string());
        self.conn_by_agent
            .entry(agent_id.to_string())
            .or_insert_with(ConnectionState::new);

        self.spawn_adapter_forward(&sub).await;
        Ok(sub)
    }

    async fn persist(&self, sub: &Subscription) -> Result<()> {
        let encoded = serde_json::to_vec(sub).map_err(|e| MailboxError::Validation(e.to_string()))?;
        self.kv
            .hset(&subscription_key(&sub.id.to_string()), "record", encoded)
            .await?;
        Ok(())
    }

    /// Forwards inbound KV pub/sub traffic for this subscription's channel
    /// to the agent's handler, if one is registered by the time a message
    /// arrives. Lets a distributed deployment share subscriptions across
    /// processes instead of only this one's in-memory fan-out.
    async fn spawn_adapter_forward(&self, sub: &Subscription) {
        let channel_or_pattern = sub.pattern.clone().unwrap_or_else(|| format!("mailbox:{}", sub.target));
        let kv = Arc::clone(&self.kv);
        let sub_id = sub.id.to_string();
        let sub_clone = sub.clone();

        let subscription = if sub.pattern.is_some() {
            kv.psubscribe(&[channel_or_pattern]).await
        } else {
            kv.subscribe(&[channel_or_pattern]).await
        };
        let Ok(mut subscription) = subscription else {
            warn!(subscription_id = %sub_id, "failed to register adapter subscription");
            return;
        };

        let handler_by_agent = Arc::clone(&self.handler_by_agent);
        let agent_id = sub.agent_id.clone();
        let handle = tokio::spawn(async move {
            while let Ok(Some(msg)) = subscription.recv().await {
                let Ok(decoded) = Message::from_wire(&msg.payload) else {
                    continue;
                };
                if let Some(handler) = handler_by_agent.get(&agent_id) {
                    if let Err(e) = handler(decoded, sub_clone.clone()).await {
                        warn!(agent_id, error = %e, "handler error during adapter forward");
                    }
                }
            }
        });
        self.adapter_subs.insert(sub_id, handle);
    }

    pub async fn remove_subscription(&self, id: &str) -> Result<bool> {
        let Some((_, sub)) = self.sub_by_id.remove(id) else {
            return Ok(false);
        };
        if let Some(handle) = self.adapter_subs.remove(id) {
            handle.1.abort();
        }
        if let Some(mut set) = self.subs_by_agent.get_mut(&sub.agent_id) {
            set.remove(id);
        }
        if let Some(mut set) = self
            .subs_by_target_or_pattern
            .get_mut(&Self::index_key(&sub.target, sub.pattern.as_deref()))
        {
            set.remove(id);
        }
        self.kv.del(&subscription_key(id)).await?;
        Ok(true)
    }

    pub fn get_active_subscriptions(&self, agent_id: &str) -> Vec<Subscription> {
        self.subs_by_agent
            .get(agent_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.sub_by_id.get(id).map(|s| s.clone()))
                    .filter(|s| s.active)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscriptions_for_target_or_pattern(&self, key: &str) -> Vec<Subscription> {
        self.subs_by_target_or_pattern
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.sub_by_id.get(id).map(|s| s.clone())).collect())
            .unwrap_or_default()
    }

    pub fn all_subscriptions(&self) -> Vec<Subscription> {
        self.sub_by_id.iter().map(|e| e.value().clone()).collect()
    }

    pub fn handle_connection_loss(&self, agent_id: &str) {
        if let Some(mut conn) = self.conn_by_agent.get_mut(agent_id) {
            conn.connected = false;
        }
        if let Some(ids) = self.subs_by_agent.get(agent_id) {
            for id in ids.iter() {
                if let Some(mut sub) = self.sub_by_id.get_mut(id) {
                    sub.active = false;
                }
            }
        }
    }

    /// Reactivates the agent's subscriptions and flushes its outbox to the
    /// handler, oldest-first.
    pub async fn handle_connection_restored(&self, agent_id: &str) -> Result<()> {
        let outbox = {
            let mut conn = self.conn_by_agent.entry(agent_id.to_string()).or_insert_with(ConnectionState::new);
            conn.connected = true;
            conn.reconnect_count += 1;
            conn.last_seen = Utc::now();
            std::mem::take(&mut conn.outbox)
        };
        if let Some(ids) = self.subs_by_agent.get(agent_id) {
            for id in ids.iter() {
                if let Some(mut sub) = self.sub_by_id.get_mut(id) {
                    sub.active = true;
                }
            }
        }
        if let Some(handler) = self.handler_by_agent.get(agent_id) {
            let subs = self.get_active_subscriptions(agent_id);
            let Some(sub) = subs.into_iter().next() else {
                return Ok(());
            };
            for msg in outbox {
                if let Err(e) = handler(msg, sub.clone()).await {
                    warn!(agent_id, error = %e, "handler error flushing outbox after reconnect");
                }
            }
        }
        Ok(())
    }

    /// Dispatches one matched message to one subscription per its delivery
    /// mode. Called by Real-Time Delivery once it has resolved candidates.
    pub async fn dispatch(&self, sub: &Subscription, msg: &Message) -> Result<()> {
        match sub.options.delivery_mode {
            DeliveryMode::Realtime => {
                if !self.rate_limiter.allow(&sub.agent_id).await {
                    debug!(agent_id = %sub.agent_id, "realtime dispatch rate-limited, queued instead");
                    self.enqueue_outbox(sub, msg.clone());
                    return Ok(());
                }
                if let Some(handler) = self.handler_by_agent.get(&sub.agent_id) {
                    handler(msg.clone(), sub.clone()).await
                } else {
                    self.enqueue_outbox(sub, msg.clone());
                    Ok(())
                }
            }
            DeliveryMode::Batch => {
                self.enqueue_outbox(sub, msg.clone());
                let should_flush = self
                    .conn_by_agent
                    .get(&sub.agent_id)
                    .map(|c| c.outbox.len() >= sub.options.batch_size)
                    .unwrap_or(false);
                if should_flush {
                    self.flush_batch(sub).await?;
                }
                Ok(())
            }
            DeliveryMode::Polling => {
                self.enqueue_outbox(sub, msg.clone());
                Ok(())
            }
        }
    }

    fn enqueue_outbox(&self, sub: &Subscription, msg: Message) {
        let mut conn = self
            .conn_by_agent
            .entry(sub.agent_id.clone())
            .or_insert_with(ConnectionState::new);
        if conn.outbox.len() >= sub.options.max_queue_size {
            conn.outbox.pop_front();
        }
        conn.outbox.push_back(msg);
        conn.last_batch_append = Some(Utc::now());
    }

    async fn flush_batch(&self, sub: &Subscription) -> Result<()> {
        let batch = {
            let Some(mut conn) = self.conn_by_agent.get_mut(&sub.agent_id) else {
                return Ok(());
            };
            std::mem::take(&mut conn.outbox)
        };
        if let Some(handler) = self.handler_by_agent.get(&sub.agent_id) {
            for msg in batch {
                if let Err(e) = handler(msg, sub.clone()).await {
                    warn!(agent_id = %sub.agent_id, error = %e, "handler error flushing batch");
                }
            }
        }
        Ok(())
    }

    /// Drains up to `limit` queued messages for POLLING-mode agents.
    pub fn pull(&self, agent_id: &str, limit: usize) -> Vec<Message> {
        let Some(mut conn) = self.conn_by_agent.get_mut(agent_id) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(limit.min(conn.outbox.len()));
        for _ in 0..limit {
            match conn.outbox.pop_front() {
                Some(msg) => out.push(msg),
                None => break,
            }
        }
        out
    }

    /// Heartbeat loop body: marks connections with no activity for
    /// `2 * heartbeat_interval` as lost.
    pub async fn heartbeat_tick(&self) -> Result<()> {
        let stale_after = chrono::Duration::from_std(self.heartbeat_interval * 2).unwrap_or(chrono::Duration::seconds(60));
        let now = Utc::now();
        let stale_agents: Vec<String> = self
            .conn_by_agent
            .iter()
            .filter(|e| e.connected && now - e.last_seen > stale_after)
            .map(|e| e.key().clone())
            .collect();
        for agent_id in stale_agents {
            debug!(agent_id, "connection marked lost by heartbeat monitor");
            self.handle_connection_loss(&agent_id);
        }
        self.batch_timeout_tick().await
    }

    /// Flushes any BATCH-mode subscription whose outbox has sat past its
    /// own `batch_timeout_secs` without hitting `batch_size`, so a slow
    /// trickle of messages doesn't wait forever for a full batch.
    async fn batch_timeout_tick(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<Subscription> = self
            .sub_by_id
            .iter()
            .filter(|e| e.value().active && e.value().options.delivery_mode == DeliveryMode::Batch)
            .filter(|e| {
                self.conn_by_agent.get(&e.value().agent_id).is_some_and(|c| {
                    !c.outbox.is_empty()
                        && c.last_batch_append.is_some_and(|t| {
                            now - t >= chrono::Duration::seconds(e.value().options.batch_timeout_secs as i64)
                        })
                })
            })
            .map(|e| e.value().clone())
            .collect();
        for sub in due {
            self.flush_batch(&sub).await?;
        }
        Ok(())
    }

    /// Cleanup loop body: drops subscriptions idle beyond 24h, clears
    /// outboxes of agents offline beyond `offline_timeout`.
    pub async fn cleanup_tick(&self) -> Result<()> {
        let now = Utc::now();
        let idle_ids: Vec<String> = self
            .sub_by_id
            .iter()
            .filter(|e| !e.value().active && now - e.value().last_activity > SUBSCRIPTION_IDLE_TTL)
            .map(|e| e.key().clone())
            .collect();
        for id in idle_ids {
            self.remove_subscription(&id).await?;
        }

        let offline_cutoff = chrono::Duration::from_std(self.offline_timeout).unwrap_or(chrono::Duration::hours(24));
        for mut entry in self.conn_by_agent.iter_mut() {
            if !entry.connected && now - entry.last_seen > offline_cutoff {
                entry.outbox.clear();
            }
        }
        Ok(())
    }
}

impl Component for SubscriptionManager {
    fn status(&self) -> ComponentStatus {
        ComponentStatus::Healthy
    }

    fn health_indicators(&self) -> Vec<(&'static str, String)> {
        vec![
            ("subscriptions", self.sub_by_id.len().to_string()),
            ("connected_agents", self.conn_by_agent.iter().filter(|e| e.connected).count().to_string()),
            ("registered_handlers", self.handler_by_agent.len().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::{AddressingMode, ContentType, DeliveryOptions, Payload, RoutingInfo};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(MemoryKv::new()))
    }

    fn msg() -> Message {
        Message::new(
            "alice",
            ContentType::Text,
            Payload::Text("hi".into()),
            RoutingInfo {
                addressing_mode: AddressingMode::Direct,
                target: "bob".into(),
                priority: Default::default(),
                ttl_seconds: None,
            },
            DeliveryOptions::default(),
            Default::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_subscription_is_idempotent_by_identity() {
        let m = manager();
        let s1 = m
            .create_subscription("bob", "bob", None, SubscriptionOptions::default())
            .await
            .unwrap();
        let s2 = m
            .create_subscription("bob", "bob", None, SubscriptionOptions::default())
            .await
            .unwrap();
        assert_eq!(s1.id, s2.id);
        assert_eq!(m.get_active_subscriptions("bob").len(), 1);
    }

    #[tokio::test]
    async fn dispatch_realtime_invokes_handler_synchronously() {
        let m = manager();
        let sub = m
            .create_subscription("bob", "bob", None, SubscriptionOptions::default())
            .await
            .unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        m.register_handler(
            "bob",
            Arc::new(move |_msg, _sub| {
                let count = Arc::clone(&count_clone);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        m.dispatch(&sub, &msg()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_restored_flushes_outbox() {
        let m = manager();
        let sub = m
            .create_subscription("bob", "bob", None, SubscriptionOptions::default())
            .await
            .unwrap();
        m.handle_connection_loss("bob");
        m.dispatch(&sub, &msg()).await.unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        m.register_handler(
            "bob",
            Arc::new(move |_msg, _sub| {
                let count = Arc::clone(&count_clone);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        m.handle_connection_restored("bob").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_subscription_drops_indices() {
        let m = manager();
        let sub = m
            .create_subscription("bob", "bob", None, SubscriptionOptions::default())
            .await
            .unwrap();
        assert!(m.remove_subscription(&sub.id.to_string()).await.unwrap());
        assert!(m.get_active_subscriptions("bob").is_empty());
    }
}
