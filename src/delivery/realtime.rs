//! Real-Time Delivery (§4.I): pattern-matched fan-out to active
//! REALTIME-mode subscribers within a broadcast latency budget, plus
//! publish to the KV channels external consumers feed from.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::warn;

use crate::delivery::pattern::subscription_matches;
use crate::error::Result;
use crate::kv::KvAdapter;
use crate::model::message::AddressingMode;
use crate::model::subscription::{DeliveryMode, Subscription};
use crate::model::Message;
use crate::subscription::SubscriptionManager;
use crate::component::{Component, ComponentStatus};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RealtimeDeliveryConfig {
    pub cache_ttl: Duration,
    pub broadcast_timeout: Duration,
}

impl Default for RealtimeDeliveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            broadcast_timeout: DEFAULT_BROADCAST_TIMEOUT,
        }
    }
}

/// Outcome of one `broadcast` call, folded into the router's SUCCESS/QUEUED
/// decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct BroadcastOutcome {
    pub handlers_invoked: u64,
    pub handler_errors: u64,
    pub handler_timeouts: u64,
    pub kv_subscribers_reached: u64,
}

impl BroadcastOutcome {
    pub fn subscribers_reached(&self) -> u64 {
        self.handlers_invoked + self.kv_subscribers_reached
    }
}

pub struct RealtimeDelivery {
    subscriptions: Arc<SubscriptionManager>,
    kv: Arc<dyn KvAdapter>,
    config: RealtimeDeliveryConfig,
    /// Single-entry cache of the subscription snapshot, refreshed every
    /// `cache_ttl`. Periodic refresh is sufficient here; no event-driven
    /// invalidation is needed for correctness.
    cache: Cache<(), Arc<Vec<Subscription>>>,
}

impl RealtimeDelivery {
    pub fn new(subscriptions: Arc<SubscriptionManager>, kv: Arc<dyn KvAdapter>, config: RealtimeDeliveryConfig) -> Self {
        let cache = Cache::builder().time_to_live(config.cache_ttl).max_capacity(1).build();
        Self {
            subscriptions,
            kv,
            config,
            cache,
        }
    }

    async fn candidates(&self) -> Arc<Vec<Subscription>> {
        let subscriptions = Arc::clone(&self.subscriptions);
        self.cache
            .get_with((), async move { Arc::new(subscriptions.all_subscriptions()) })
            .await
    }

    fn channels_for(mode: AddressingMode, target: &str) -> Vec<String> {
        match mode {
            AddressingMode::Direct => vec![format!("mailbox:{target}")],
            AddressingMode::Topic => vec![format!("topic:{target}")],
            AddressingMode::Broadcast => vec!["broadcast:all".to_string(), "mailbox:*".to_string()],
        }
    }

    /// Step 1-3 of `broadcast` (§4.I): match, group by agent, dispatch in
    /// parallel within the broadcast deadline. No KV publish — callers that
    /// need the external-consumer feed too (the Router dispatching DIRECT
    /// or BROADCAST) call `publish_external` themselves; callers that
    /// already published through another path (the Topic Manager) don't
    /// pay for it twice.
    pub async fn dispatch_local(&self, msg: &Message) -> Result<BroadcastOutcome> {
        let mode = msg.routing_info.addressing_mode;
        let target = msg.routing_info.target.as_str();

        let snapshot = self.candidates().await;
        let mut by_agent: std::collections::HashMap<String, Subscription> = std::collections::HashMap::new();
        for sub in snapshot.iter() {
            if !sub.active || sub.options.delivery_mode != DeliveryMode::Realtime {
                continue;
            }
            if !self.subscriptions.has_handler(&sub.agent_id) {
                continue;
            }
            if !subscription_matches(sub, target, mode) {
                continue;
            }
            if let Some(filter) = &sub.options.message_filter
                && !filter.matches(msg, &[])
            {
                continue;
            }
            by_agent.entry(sub.agent_id.clone()).or_insert_with(|| sub.clone());
        }

        let timeout = self.config.broadcast_timeout;
        let dispatches = by_agent.into_values().map(|sub| {
            let subscriptions = Arc::clone(&self.subscriptions);
            let msg = msg.clone();
            async move { tokio::time::timeout(timeout, subscriptions.dispatch(&sub, &msg)).await }
        });
        let results = futures::future::join_all(dispatches).await;

        let mut outcome = BroadcastOutcome::default();
        for result in results {
            match result {
                Ok(Ok(())) => outcome.handlers_invoked += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "handler error during broadcast");
                    outcome.handler_errors += 1;
                }
                Err(_) => outcome.handler_timeouts += 1,
            }
        }
        Ok(outcome)
    }

    /// Step 4 of `broadcast` (§4.I): publish on the KV channels appropriate
    /// to the addressing mode, returning the subscriber count reached.
    pub async fn publish_external(&self, msg: &Message) -> Result<u64> {
        let mode = msg.routing_info.addressing_mode;
        let target = msg.routing_info.target.as_str();
        let body = msg.to_wire()?;
        let mut reached = 0;
        for channel in Self::channels_for(mode, target) {
            reached += self.kv.publish(&channel, body.clone()).await?;
        }
        Ok(reached)
    }

    /// Convenience combining `dispatch_local` and `publish_external` for
    /// callers that want the full fan-out in one call.
    pub async fn broadcast(&self, msg: &Message) -> Result<BroadcastOutcome> {
        let mut outcome = self.dispatch_local(msg).await?;
        outcome.kv_subscribers_reached = self.publish_external(msg).await?;
        Ok(outcome)
    }
}

impl Component for RealtimeDelivery {
    fn status(&self) -> ComponentStatus {
        ComponentStatus::Healthy
    }

    fn health_indicators(&self) -> Vec<(&'static str, String)> {
        vec![
            ("cached_snapshot_entries", self.cache.entry_count().to_string()),
            ("broadcast_timeout_ms", self.config.broadcast_timeout.as_millis().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::{ContentType, DeliveryOptions, Payload, RoutingInfo, SubscriptionOptions};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn delivery() -> (Arc<SubscriptionManager>, RealtimeDelivery) {
        let kv = Arc::new(MemoryKv::new());
        let subs = Arc::new(SubscriptionManager::new(kv.clone()));
        let rt = RealtimeDelivery::new(Arc::clone(&subs), kv, RealtimeDeliveryConfig::default());
        (subs, rt)
    }

    fn direct_msg(target: &str) -> Message {
        Message::new(
            "alpha",
            ContentType::Text,
            Payload::Text("hi".into()),
            RoutingInfo {
                addressing_mode: AddressingMode::Direct,
                target: target.into(),
                priority: Default::default(),
                ttl_seconds: None,
            },
            DeliveryOptions::default(),
            Default::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn broadcast_invokes_matching_handler_once() {
        let (subs, rt) = delivery();
        subs.create_subscription("bob", "inbox-bravo", None, SubscriptionOptions::default())
            .await
            .unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        subs.register_handler(
            "bob",
            Arc::new(move |_msg, _sub| {
                let count = Arc::clone(&count_clone);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let outcome = rt.broadcast(&direct_msg("inbox-bravo")).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.handlers_invoked, 1);
    }

    #[tokio::test]
    async fn broadcast_with_no_subscribers_still_reports_kv_publish() {
        let (_subs, rt) = delivery();
        let outcome = rt.broadcast(&direct_msg("nobody-home")).await.unwrap();
        assert_eq!(outcome.handlers_invoked, 0);
        assert_eq!(outcome.kv_subscribers_reached, 0);
    }
}
