//! Message Router (§4.J): validate → enrich → expiry-check → dispatch →
//! confirmation-tracking pipeline, plus the retry and cleanup loops that
//! keep `DeliveryConfirmation` state honest over time.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::component::{Component, ComponentStatus};
use crate::delivery::{BroadcastOutcome, RealtimeDelivery};
use crate::error::{MailboxError, Result};
use crate::kv::KvAdapter;
use crate::model::{
    AddressingMode, DeliveryAttempt, DeliveryConfirmation, DeliveryStatus, Message, RoutingResult,
    TopicConfig,
};
use crate::offline::OfflineHandler;
use crate::resilience::ResilienceManager;
use crate::storage::MailboxStore;
use crate::subscription::SubscriptionManager;
use crate::topic::TopicManager;

use super::config::{backoff_delay, RouterConfig};

fn message_key(id: &str) -> String {
    format!("message:{id}")
}
fn confirmation_key(id: &str) -> String {
    format!("delivery_confirmation:{id}")
}

pub struct Router {
    kv: Arc<dyn KvAdapter>,
    resilience: Arc<ResilienceManager>,
    mailbox_store: Arc<MailboxStore>,
    offline: Arc<OfflineHandler>,
    realtime: Arc<RealtimeDelivery>,
    subscriptions: Arc<SubscriptionManager>,
    topics: Arc<TopicManager>,
    config: RouterConfig,
    pending: DashMap<String, DeliveryConfirmation>,
    dead_letters: Mutex<VecDeque<(DeliveryConfirmation, String)>>,
}

impl Router {
    pub fn new(
        kv: Arc<dyn KvAdapter>,
        resilience: Arc<ResilienceManager>,
        mailbox_store: Arc<MailboxStore>,
        offline: Arc<OfflineHandler>,
        realtime: Arc<RealtimeDelivery>,
        subscriptions: Arc<SubscriptionManager>,
        topics: Arc<TopicManager>,
        config: RouterConfig,
    ) -> Self {
        let replay_store = Arc::clone(&mailbox_store);
        resilience.register_replayer("mailbox_store.store_message", move |payload: serde_json::Value| {
            let store = Arc::clone(&replay_store);
            async move {
                let msg: Message = serde_json::from_value(payload)
                    .map_err(|e| MailboxError::Validation(e.to_string()))?;
                store.store_message(&msg.routing_info.target, &msg).await
            }
        });

        Self {
            kv,
            resilience,
            mailbox_store,
            offline,
            realtime,
            subscriptions,
            topics,
            config,
            pending: DashMap::new(),
            dead_letters: Mutex::new(VecDeque::new()),
        }
    }

    /// Rebuilds `pending` from the durable `delivery_confirmation:*` scan
    /// (§4.J durability) and spawns the retry/cleanup loops.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        for key in self.kv.keys("delivery_confirmation:*").await? {
            let Some(body) = self.kv.hget(&key, "record").await? else {
                continue;
            };
            match serde_json::from_slice::<DeliveryConfirmation>(&body) {
                Ok(confirmation) => {
                    self.pending.insert(confirmation.message_id.to_string(), confirmation);
                }
                Err(e) => warn!(key, error = %e, "skipping corrupt delivery confirmation on rebuild"),
            }
        }
        Ok(self.spawn_background_loops())
    }

    /// Flushes non-terminal PENDING confirmations back to KV (§4.J
    /// durability) so a clean shutdown doesn't lose in-flight state.
    pub async fn stop(&self) -> Result<()> {
        for entry in self.pending.iter() {
            if entry.status == DeliveryStatus::Pending {
                self.persist_confirmation(&entry).await?;
            }
        }
        Ok(())
    }

    pub fn spawn_background_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let retry = {
            let router = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(router.config.retry_check_interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = router.retry_tick().await {
                        warn!(error = %e, "router retry tick failed");
                    }
                }
            })
        };
        let cleanup = {
            let router = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(router.config.cleanup_interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = router.cleanup_tick().await {
                        warn!(error = %e, "router cleanup tick failed");
                    }
                }
            })
        };
        vec![retry, cleanup]
    }

    /// §4.J pipeline: validate, enrich, check expiry, dispatch by addressing
    /// mode, then track confirmation state if requested.
    pub async fn route_message(&self, msg: &Message) -> Result<RoutingResult> {
        if let Err(e) = msg.validate() {
            debug!(error = %e, "message failed validation");
            return Ok(RoutingResult::Rejected);
        }

        let now = Utc::now();
        let enriched = msg.enrich(&self.config.router_version, now);

        if enriched.is_expired(now) {
            debug!(message_id = %enriched.id, "message expired before routing");
            if enriched.delivery_options.confirmation_required {
                self.handle_delivery_confirmation(
                    &enriched.id.to_string(),
                    DeliveryStatus::Expired,
                    &enriched.routing_info.target,
                    Some("ttl elapsed before routing".into()),
                    None,
                )
                .await?;
            }
            return Ok(RoutingResult::Rejected);
        }

        self.persist_durable_message(&enriched).await?;

        if enriched.delivery_options.confirmation_required {
            let confirmation =
                DeliveryConfirmation::new_pending(enriched.id, enriched.routing_info.target.clone());
            self.persist_confirmation(&confirmation).await?;
            self.pending.insert(enriched.id.to_string(), confirmation);
        }

        let start = std::time::Instant::now();
        let (result, reached) = match self.dispatch_by_mode(&enriched).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(message_id = %enriched.id, error = %e, "dispatch failed");
                (RoutingResult::Failed, 0)
            }
        };
        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(message_id = %enriched.id, ?result, subscribers_reached = reached, "routed message");

        if enriched.delivery_options.confirmation_required {
            let status = match result {
                RoutingResult::Success => DeliveryStatus::Delivered,
                RoutingResult::Queued => DeliveryStatus::Pending,
                RoutingResult::Failed | RoutingResult::Rejected => DeliveryStatus::Failed,
            };
            self.handle_delivery_confirmation(
                &enriched.id.to_string(),
                status,
                &enriched.routing_info.target,
                None,
                Some(latency_ms),
            )
            .await?;
        }

        Ok(result)
    }

    async fn dispatch_by_mode(&self, msg: &Message) -> Result<(RoutingResult, u64)> {
        match msg.routing_info.addressing_mode {
            AddressingMode::Direct => self.dispatch_direct(msg).await,
            AddressingMode::Broadcast => self.dispatch_broadcast(msg).await,
            AddressingMode::Topic => self.dispatch_topic(msg).await,
        }
    }

    /// DIRECT: persist to `mailbox:{target}`, fan out locally and over KV;
    /// if no local handler picked it up, durably queue it for the target's
    /// subscribed agents as a restart-safe fallback to the in-memory outbox.
    async fn dispatch_direct(&self, msg: &Message) -> Result<(RoutingResult, u64)> {
        let target = msg.routing_info.target.clone();
        self.persist_direct(&target, msg).await;

        let outcome = self.realtime_fanout(msg).await;
        if outcome.handlers_invoked == 0 {
            self.queue_offline_for_target(&target, msg).await;
        }
        let reached = outcome.subscribers_reached();
        let result = if reached > 0 { RoutingResult::Success } else { RoutingResult::Queued };
        Ok((result, reached))
    }

    /// BROADCAST: persist a per-mailbox copy to every known mailbox (errors
    /// on one mailbox are logged and do not abort the others), then fan out
    /// to REALTIME subscribers and the `broadcast:all`/`mailbox:*` channels.
    async fn dispatch_broadcast(&self, msg: &Message) -> Result<(RoutingResult, u64)> {
        let mailboxes = self.mailbox_store.list_mailboxes().await?;
        for mailbox in &mailboxes {
            let mut copy = msg.clone();
            copy.routing_info.target = mailbox.clone();
            self.persist_direct(mailbox, &copy).await;
        }

        let outcome = self.realtime_fanout(msg).await;
        let reached = outcome.subscribers_reached();
        let result = if reached > 0 { RoutingResult::Success } else { RoutingResult::Queued };
        Ok((result, reached))
    }

    /// TOPIC: delegates external persistence+publish to the Topic Manager
    /// (so TOPIC addressing never double-publishes on `topic:{target}`) and
    /// only uses Real-Time Delivery for the local handler fan-out.
    async fn dispatch_topic(&self, msg: &Message) -> Result<(RoutingResult, u64)> {
        let target = msg.routing_info.target.clone();
        if self.topics.get_topic_by_name(&target).is_none() {
            let _ = self.topics.create_topic(TopicConfig::new(&target)).await;
        }

        let external = match self.topics.publish_to_topic(&target, msg).await {
            Ok(n) => n,
            Err(e) => {
                warn!(target, error = %e, "topic publish failed");
                0
            }
        };
        let local = match self.realtime.dispatch_local(msg).await {
            Ok(outcome) => outcome.handlers_invoked,
            Err(e) => {
                warn!(error = %e, "realtime dispatch_local failed");
                0
            }
        };

        let reached = external + local;
        let result = if reached > 0 { RoutingResult::Success } else { RoutingResult::Queued };
        Ok((result, reached))
    }

    /// Persists through the Resilience Manager so a backend outage parks
    /// the write in the fallback queue instead of failing the route.
    async fn persist_direct(&self, target: &str, msg: &Message) {
        let mailbox_store = Arc::clone(&self.mailbox_store);
        let target_owned = target.to_string();
        let msg_owned = msg.clone();
        let payload = serde_json::to_value(msg).unwrap_or(serde_json::Value::Null);

        let result = self
            .resilience
            .execute_or_queue("mailbox_store.store_message", payload, move || {
                let mailbox_store = Arc::clone(&mailbox_store);
                let target_owned = target_owned.clone();
                async move { mailbox_store.store_message(&target_owned, &msg_owned).await }
            })
            .await;
        if let Err(e) = result {
            warn!(target, error = %e, "direct persist failed, queued for fallback replay");
        }
    }

    async fn realtime_fanout(&self, msg: &Message) -> BroadcastOutcome {
        let mut outcome = match self.realtime.dispatch_local(msg).await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "realtime dispatch_local failed");
                BroadcastOutcome::default()
            }
        };
        match self.realtime.publish_external(msg).await {
            Ok(reached) => outcome.kv_subscribers_reached = reached,
            Err(e) => warn!(error = %e, "realtime publish_external failed"),
        }
        outcome
    }

    async fn queue_offline_for_target(&self, target: &str, msg: &Message) {
        let agents: Vec<String> = self
            .subscriptions
            .subscriptions_for_target_or_pattern(target)
            .into_iter()
            .map(|s| s.agent_id)
            .collect();
        let ttl = msg.routing_info.ttl_seconds.map(std::time::Duration::from_secs);
        for agent in agents {
            if let Err(e) = self.offline.queue_for_offline(msg, &agent, target, ttl).await {
                warn!(agent, error = %e, "failed to queue offline delivery");
            }
        }
    }

    async fn persist_durable_message(&self, msg: &Message) -> Result<()> {
        let body = msg.to_wire()?;
        self.kv.hset(&message_key(&msg.id.to_string()), "record", body).await?;
        Ok(())
    }

    async fn load_durable_message(&self, msg_id: &str) -> Result<Option<Message>> {
        let Some(body) = self.kv.hget(&message_key(msg_id), "record").await? else {
            return Ok(None);
        };
        Ok(Some(Message::from_wire(&body)?))
    }

    async fn persist_confirmation(&self, confirmation: &DeliveryConfirmation) -> Result<()> {
        let encoded =
            serde_json::to_vec(confirmation).map_err(|e| MailboxError::Validation(e.to_string()))?;
        let key = confirmation_key(&confirmation.message_id.to_string());
        self.kv.hset(&key, "record", encoded).await?;
        self.kv.expire(&key, self.config.confirmation_ttl).await?;
        Ok(())
    }

    /// Single mutation point for `DeliveryConfirmation` state (§6 facade).
    /// Schedules a retry on FAILED while attempts remain, or moves the
    /// confirmation to the dead-letter ring once the budget is exhausted.
    pub async fn handle_delivery_confirmation(
        &self,
        msg_id: &str,
        status: DeliveryStatus,
        target: &str,
        error: Option<String>,
        latency_ms: Option<u64>,
    ) -> Result<()> {
        let id = crate::model::ids::parse_message_id(msg_id)?;
        let mut confirmation = self
            .pending
            .get(msg_id)
            .map(|e| e.clone())
            .unwrap_or_else(|| DeliveryConfirmation::new_pending(id, target));

        let attempt_n = confirmation.attempts.len() as u32 + 1;
        confirmation.attempts.push(DeliveryAttempt {
            n: attempt_n,
            timestamp: Utc::now(),
            target: target.to_string(),
            status,
            error: error.clone(),
            latency_ms,
        });
        confirmation.status = status;
        confirmation.updated_at = Utc::now();

        match status {
            DeliveryStatus::Failed if attempt_n < self.config.max_retry_attempts => {
                let delay = backoff_delay(&self.config, attempt_n);
                confirmation.next_retry_at =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            }
            DeliveryStatus::Failed => {
                confirmation.next_retry_at = None;
                warn!(message_id = msg_id, attempts = attempt_n, "exhausted retry budget");
                self.move_to_dead_letter(
                    confirmation.clone(),
                    error.unwrap_or_else(|| "delivery failed".into()),
                );
            }
            _ => confirmation.next_retry_at = None,
        }

        self.persist_confirmation(&confirmation).await?;
        self.pending.insert(msg_id.to_string(), confirmation);
        Ok(())
    }

    pub fn get_delivery_status(&self, msg_id: &str) -> Option<DeliveryConfirmation> {
        self.pending.get(msg_id).map(|e| e.clone())
    }

    fn move_to_dead_letter(&self, confirmation: DeliveryConfirmation, reason: String) {
        let mut dead = self.dead_letters.lock();
        if dead.len() >= self.config.max_dead_letters {
            dead.pop_front();
        }
        dead.push_back((confirmation, reason));
    }

    pub fn dead_letters(&self) -> Vec<(DeliveryConfirmation, String)> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    /// Re-routes confirmations whose `next_retry_at` has elapsed, plus any
    /// still-PENDING confirmation (a QUEUED message has no backoff schedule
    /// of its own, but still needs a sweep each tick to notice a newly
    /// available subscriber or a TTL that has since elapsed).
    async fn retry_tick(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|e| {
                (e.status == DeliveryStatus::Failed && e.next_retry_at.is_some_and(|t| t <= now))
                    || e.status == DeliveryStatus::Pending
            })
            .map(|e| (e.key().clone(), e.target.clone()))
            .collect();

        for (msg_id, target) in due {
            let Some(msg) = self.load_durable_message(&msg_id).await? else {
                self.pending.remove(&msg_id);
                continue;
            };
            if msg.is_expired(now) {
                debug!(message_id = msg_id, "message expired before retry");
                self.handle_delivery_confirmation(
                    &msg_id,
                    DeliveryStatus::Expired,
                    &target,
                    Some("ttl elapsed before retry".into()),
                    None,
                )
                .await?;
                continue;
            }
            debug!(message_id = msg_id, "retrying delivery");
            let start = std::time::Instant::now();
            let outcome = self.dispatch_by_mode(&msg).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok((RoutingResult::Success, _)) => {
                    self.handle_delivery_confirmation(
                        &msg_id,
                        DeliveryStatus::Delivered,
                        &target,
                        None,
                        Some(latency_ms),
                    )
                    .await?;
                }
                Ok(_) => {
                    self.handle_delivery_confirmation(
                        &msg_id,
                        DeliveryStatus::Failed,
                        &target,
                        Some("no subscribers reached on retry".into()),
                        Some(latency_ms),
                    )
                    .await?;
                }
                Err(e) => {
                    self.handle_delivery_confirmation(
                        &msg_id,
                        DeliveryStatus::Failed,
                        &target,
                        Some(e.to_string()),
                        Some(latency_ms),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Drops terminal confirmations older than `confirmation_ttl` (§4.J).
    async fn cleanup_tick(&self) -> Result<()> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.confirmation_ttl).unwrap_or(chrono::Duration::hours(1));
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.is_terminal() && now - e.updated_at > ttl)
            .map(|e| e.key().clone())
            .collect();

        for msg_id in stale {
            self.pending.remove(&msg_id);
            self.kv.del(&confirmation_key(&msg_id)).await?;
            self.kv.del(&message_key(&msg_id)).await?;
        }
        Ok(())
    }
}

impl Component for Router {
    fn status(&self) -> ComponentStatus {
        if !self.resilience.healthy() {
            return ComponentStatus::Degraded;
        }
        if self.dead_letters.lock().len() >= self.config.max_dead_letters {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }

    fn health_indicators(&self) -> Vec<(&'static str, String)> {
        vec![
            ("pending_confirmations", self.pending.len().to_string()),
            ("dead_letters", self.dead_letters.lock().len().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::{ContentType, DeliveryOptions, Payload, RoutingInfo};
    use crate::resilience::{CircuitBreakerConfig, FallbackQueueConfig};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn router() -> Router {
        let kv: Arc<dyn KvAdapter> = Arc::new(MemoryKv::new());
        let resilience = Arc::new(ResilienceManager::new(
            CircuitBreakerConfig::default(),
            FallbackQueueConfig::default(),
        ));
        let mailbox_store = Arc::new(MailboxStore::new(Arc::clone(&kv)));
        let offline = Arc::new(OfflineHandler::new(Arc::clone(&kv)));
        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&kv)));
        let realtime = Arc::new(RealtimeDelivery::new(
            Arc::clone(&subscriptions),
            Arc::clone(&kv),
            Default::default(),
        ));
        let topics = Arc::new(TopicManager::new(Arc::clone(&kv), Arc::clone(&subscriptions)));
        Router::new(
            kv,
            resilience,
            mailbox_store,
            offline,
            realtime,
            subscriptions,
            topics,
            RouterConfig::default(),
        )
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
    async fn direct_message_with_live_handler_succeeds() {
        let r = router();
        r.subscriptions
            .create_subscription("bob", "inbox-bravo", None, Default::default())
            .await
            .unwrap();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        r.subscriptions.register_handler(
            "bob",
            Arc::new(move |_msg, _sub| {
                let count = Arc::clone(&count_clone);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let result = r.route_message(&direct_msg("inbox-bravo")).await.unwrap();
        assert_eq!(result, RoutingResult::Success);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn direct_message_with_no_subscribers_is_queued() {
        let r = router();
        let result = r.route_message(&direct_msg("nobody-home")).await.unwrap();
        assert_eq!(result, RoutingResult::Queued);
    }

    #[tokio::test]
    async fn invalid_message_is_rejected() {
        let r = router();
        let mut msg = direct_msg("inbox-bravo");
        msg.routing_info.ttl_seconds = Some(0);
        let result = r.route_message(&msg).await.unwrap();
        assert_eq!(result, RoutingResult::Rejected);
    }

    #[tokio::test]
    async fn expired_message_is_rejected() {
        let r = router();
        let mut msg = direct_msg("inbox-bravo");
        msg.routing_info.ttl_seconds = Some(1);
        msg.timestamp = Utc::now() - chrono::Duration::seconds(5);
        let result = r.route_message(&msg).await.unwrap();
        assert_eq!(result, RoutingResult::Rejected);
    }

    #[tokio::test]
    async fn failed_confirmation_schedules_retry_until_budget_exhausted() {
        let r = router();
        let msg_id = crate::model::ids::MessageId::new();
        for n in 1..=2 {
            r.handle_delivery_confirmation(&msg_id.to_string(), DeliveryStatus::Failed, "inbox", None, None)
                .await
                .unwrap();
            let confirmation = r.get_delivery_status(&msg_id.to_string()).unwrap();
            assert_eq!(confirmation.attempts.len(), n);
            assert!(confirmation.next_retry_at.is_some());
        }
        r.handle_delivery_confirmation(&msg_id.to_string(), DeliveryStatus::Failed, "inbox", None, None)
            .await
            .unwrap();
        let confirmation = r.get_delivery_status(&msg_id.to_string()).unwrap();
        assert!(confirmation.next_retry_at.is_none());
        assert!(confirmation.is_terminal());
        assert_eq!(r.dead_letters().len(), 1);
    }
}
