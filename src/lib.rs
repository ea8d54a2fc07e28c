//! Inter-LLM Mailbox: a durable, multi-tenant message plane for routing,
//! queueing, and fanning out messages between autonomous agents.
//!
//! [`Mailbox`] is the composition root. It owns every component (KV
//! Adapter, Resilience Layer, Mailbox Storage, Offline Handler,
//! Subscription Manager, Topic Manager, Real-Time Delivery, Router) and
//! exposes them as a single facade; nothing in this crate knows about any
//! particular transport.

pub mod component;
pub mod delivery;
pub mod error;
pub mod kv;
pub mod model;
pub mod offline;
pub mod resilience;
pub mod router;
pub mod storage;
pub mod subscription;
pub mod topic;
pub mod utils;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

pub use component::{Component, ComponentStatus};
pub use error::{MailboxError, Result};

use delivery::{RealtimeDelivery, RealtimeDeliveryConfig};
use kv::KvAdapter;
use model::{
    DeliveryConfirmation, DeliveryStatus, MailboxMetadata, Message, MessageFilter, RoutingResult,
    Subscription, SubscriptionOptions, Topic, TopicConfig,
};
use offline::OfflineHandler;
use resilience::{CircuitBreakerConfig, FallbackQueueConfig, ResilienceManager};
use router::{Router, RouterConfig};
use storage::{MailboxStore, MessagePage};
use subscription::{Handler, SubscriptionManager};
use topic::TopicManager;

/// Construction-time configuration for every component, one `*Config`
/// struct per component (§9.C) — no environment or file loading lives
/// here, embedders build this however they like and pass it in.
#[derive(Debug, Clone, Default)]
pub struct MailboxConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub fallback_queue: FallbackQueueConfig,
    pub realtime_delivery: RealtimeDeliveryConfig,
    pub router: RouterConfig,
}

pub struct Mailbox {
    resilience: Arc<ResilienceManager>,
    mailbox_store: Arc<MailboxStore>,
    offline: Arc<OfflineHandler>,
    subscriptions: Arc<SubscriptionManager>,
    topics: Arc<TopicManager>,
    realtime: Arc<RealtimeDelivery>,
    router: Arc<Router>,
}

impl Mailbox {
    pub fn new(kv: Arc<dyn KvAdapter>, config: MailboxConfig) -> Arc<Self> {
        let resilience = Arc::new(ResilienceManager::new(config.circuit_breaker, config.fallback_queue));
        let mailbox_store = Arc::new(MailboxStore::new(Arc::clone(&kv)));
        let offline = Arc::new(OfflineHandler::new(Arc::clone(&kv)));
        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&kv)));
        let topics = Arc::new(TopicManager::new(Arc::clone(&kv), Arc::clone(&subscriptions)));
        let realtime = Arc::new(RealtimeDelivery::new(
            Arc::clone(&subscriptions),
            Arc::clone(&kv),
            config.realtime_delivery,
        ));
        let router = Arc::new(Router::new(
            kv,
            Arc::clone(&resilience),
            Arc::clone(&mailbox_store),
            Arc::clone(&offline),
            Arc::clone(&realtime),
            Arc::clone(&subscriptions),
            Arc::clone(&topics),
            config.router,
        ));

        Arc::new(Self {
            resilience,
            mailbox_store,
            offline,
            subscriptions,
            topics,
            realtime,
            router,
        })
    }

    /// Rebuilds durable router state and starts every background loop this
    /// crate owns (retry/cleanup, circuit-breaker health sweep, fallback
    /// queue drain, subscription heartbeat/cleanup, topic cleanup, offline
    /// queue expiry). Callers own the returned handles' lifetime.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = self.router.start().await?;

        let (health, queue) = self.resilience.spawn_background_loops();
        handles.push(health);
        handles.push(queue);

        handles.extend(self.spawn_subscription_loops());
        handles.push(self.spawn_topic_loop());
        handles.push(self.spawn_offline_loop());

        Ok(handles)
    }

    /// Flushes non-terminal router state back to durable storage. Other
    /// components keep nothing that isn't already persisted on write.
    pub async fn stop(&self) -> Result<()> {
        self.router.stop().await
    }

    fn spawn_subscription_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let subscriptions = Arc::clone(&self.subscriptions);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(subscription::manager::DEFAULT_HEARTBEAT_INTERVAL);
                loop {
                    ticker.tick().await;
                    if let Err(e) = subscriptions.heartbeat_tick().await {
                        warn!(error = %e, "subscription heartbeat tick failed");
                    }
                }
            })
        };
        let cleanup = {
            let subscriptions = Arc::clone(&self.subscriptions);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(subscription::manager::DEFAULT_CLEANUP_INTERVAL);
                loop {
                    ticker.tick().await;
                    if let Err(e) = subscriptions.cleanup_tick().await {
                        warn!(error = %e, "subscription cleanup tick failed");
                    }
                }
            })
        };
        vec![heartbeat, cleanup]
    }

    fn spawn_topic_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let topics = Arc::clone(&self.topics);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                if let Err(e) = topics.cleanup_tick().await {
                    warn!(error = %e, "topic cleanup tick failed");
                }
            }
        })
    }

    fn spawn_offline_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let offline = Arc::clone(&self.offline);
        let subscriptions = Arc::clone(&self.subscriptions);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                let agents = subscriptions.known_agents();
                if let Err(e) = offline.cleanup(&agents).await {
                    warn!(error = %e, "offline queue cleanup tick failed");
                }
            }
        })
    }

    // -- Router (§4.J) --------------------------------------------------

    pub async fn route_message(&self, msg: &Message) -> Result<RoutingResult> {
        self.router.route_message(msg).await
    }

    pub fn validate_message(&self, msg: &Message) -> Result<()> {
        msg.validate()
    }

    pub async fn handle_delivery_confirmation(
        &self,
        msg_id: &str,
        status: DeliveryStatus,
        target: &str,
        error: Option<String>,
        latency_ms: Option<u64>,
    ) -> Result<()> {
        self.router
            .handle_delivery_confirmation(msg_id, status, target, error, latency_ms)
            .await
    }

    pub fn get_delivery_status(&self, msg_id: &str) -> Option<DeliveryConfirmation> {
        self.router.get_delivery_status(msg_id)
    }

    pub fn dead_letters(&self) -> Vec<(DeliveryConfirmation, String)> {
        self.router.dead_letters()
    }

    // -- Subscription Manager (§4.H) -------------------------------------

    pub fn register_handler(&self, agent_id: &str, handler: Handler) {
        self.subscriptions.register_handler(agent_id, handler);
    }

    pub fn unregister_handler(&self, agent_id: &str) {
        self.subscriptions.unregister_handler(agent_id);
    }

    pub async fn create_subscription(
        &self,
        agent_id: &str,
        target: &str,
        pattern: Option<String>,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.subscriptions.create_subscription(agent_id, target, pattern, options).await
    }

    pub async fn remove_subscription(&self, sub_id: &str) -> Result<bool> {
        self.subscriptions.remove_subscription(sub_id).await
    }

    pub fn get_active_subscriptions(&self, agent_id: &str) -> Vec<Subscription> {
        self.subscriptions.get_active_subscriptions(agent_id)
    }

    /// Marks an agent's subscriptions inactive. Not part of the minimal §6
    /// facade, but the connection-state half of it a gateway still needs to
    /// drive from its own transport-level disconnect events.
    pub fn handle_connection_loss(&self, agent_id: &str) {
        self.subscriptions.handle_connection_loss(agent_id);
    }

    /// Reactivates an agent's subscriptions, flushes its in-memory outbox to
    /// its registered handler, then replays anything the Offline Message
    /// Handler (§4.F) durably queued for it while no handler was registered
    /// at all.
    pub async fn handle_connection_restored(&self, agent_id: &str) -> Result<()> {
        self.subscriptions.handle_connection_restored(agent_id).await?;
        self.replay_offline_queue(agent_id).await
    }

    /// Drains the durable offline queue for `agent_id` into its registered
    /// handler. A no-op if the agent has none registered yet.
    async fn replay_offline_queue(&self, agent_id: &str) -> Result<()> {
        if !self.subscriptions.has_handler(agent_id) {
            return Ok(());
        }
        let queued = self.offline.get_queued(agent_id, 10_000, 0, None).await?;
        if queued.is_empty() {
            return Ok(());
        }
        let sub = self
            .subscriptions
            .get_active_subscriptions(agent_id)
            .into_iter()
            .next()
            .unwrap_or_else(|| Subscription::new(agent_id, &queued[0].mailbox_name, None, SubscriptionOptions::default()));

        let mut delivered = Vec::with_capacity(queued.len());
        for offline in queued.into_iter().rev() {
            let msg_id = offline.message.id.to_string();
            match self.subscriptions.invoke_handler(agent_id, &offline.message, &sub).await {
                Some(Ok(())) => {
                    self.offline.mark_delivered(&msg_id, agent_id).await?;
                    delivered.push(msg_id);
                }
                Some(Err(e)) => warn!(agent_id, error = %e, "offline replay handler failed"),
                None => {}
            }
        }
        if !delivered.is_empty() {
            self.offline.remove_delivered(agent_id, &delivered).await?;
        }
        Ok(())
    }

    // -- Mailbox Storage (§4.E) -------------------------------------------

    pub async fn create_mailbox(&self, name: &str, creator: &str) -> Result<MailboxMetadata> {
        self.mailbox_store.create_mailbox(name, creator).await
    }

    pub async fn get_messages(
        &self,
        mailbox: &str,
        offset: u64,
        limit: u64,
        filter: Option<&MessageFilter>,
        reverse: bool,
    ) -> Result<MessagePage> {
        self.mailbox_store.get_messages(mailbox, offset, limit, filter, reverse).await
    }

    pub async fn get_message(&self, mailbox: &str, msg_id: &str) -> Result<Option<Message>> {
        self.mailbox_store.get_message(mailbox, msg_id).await
    }

    pub async fn delete_message(&self, mailbox: &str, msg_id: &str) -> Result<bool> {
        self.mailbox_store.delete_message(mailbox, msg_id).await
    }

    pub async fn mark_message_read(&self, mailbox: &str, msg_id: &str, agent_id: &str) -> Result<bool> {
        self.mailbox_store.mark_message_read(mailbox, msg_id, agent_id).await
    }

    pub async fn get_unread_count(&self, mailbox: &str, agent_id: &str) -> Result<u64> {
        self.mailbox_store.get_unread_count(mailbox, agent_id).await
    }

    // -- Topic Manager (§4.G) ---------------------------------------------

    pub async fn create_topic(&self, config: TopicConfig) -> Result<Topic> {
        self.topics.create_topic(config).await
    }

    pub async fn subscribe_to_topic(
        &self,
        agent_id: &str,
        name: &str,
        options: SubscriptionOptions,
        include_children: bool,
    ) -> Result<Subscription> {
        self.topics.subscribe_to_topic(agent_id, name, options, include_children).await
    }

    pub async fn publish_to_topic(&self, name: &str, msg: &Message) -> Result<u64> {
        self.topics.publish_to_topic(name, msg).await
    }
}

impl Component for Mailbox {
    fn status(&self) -> ComponentStatus {
        let statuses = [
            self.resilience.status(),
            self.subscriptions.status(),
            self.topics.status(),
            self.realtime.status(),
            self.router.status(),
        ];
        if statuses.iter().any(|s| *s == ComponentStatus::Unavailable) {
            ComponentStatus::Unavailable
        } else if statuses.iter().any(|s| *s == ComponentStatus::Degraded) {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }

    fn health_indicators(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        out.extend(self.resilience.health_indicators());
        out.extend(self.subscriptions.health_indicators());
        out.extend(self.topics.health_indicators());
        out.extend(self.realtime.health_indicators());
        out.extend(self.router.health_indicators());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv::MemoryKv;

    fn mailbox() -> Arc<Mailbox> {
        Mailbox::new(Arc::new(MemoryKv::new()), MailboxConfig::default())
    }

    #[tokio::test]
    async fn facade_round_trips_a_mailbox_message() {
        let mb = mailbox();
        mb.create_mailbox("inbox-a", "alice").await.unwrap();

        let msg = Message::new(
            "alice",
            model::ContentType::Text,
            model::Payload::Text("hello".into()),
            model::RoutingInfo {
                addressing_mode: model::AddressingMode::Direct,
                target: "inbox-a".into(),
                priority: Default::default(),
                ttl_seconds: None,
            },
            model::DeliveryOptions::default(),
            Default::default(),
        )
        .unwrap();

        let result = mb.route_message(&msg).await.unwrap();
        assert!(matches!(result, RoutingResult::Queued | RoutingResult::Success));

        let page = mb.get_messages("inbox-a", 0, 10, None, false).await.unwrap();
        assert_eq!(page.messages.len(), 1);
    }

    #[tokio::test]
    async fn facade_creates_and_publishes_to_a_topic() {
        let mb = mailbox();
        mb.create_topic(TopicConfig::new("agents.status")).await.unwrap();
        let count = mb
            .publish_to_topic(
                "agents.status",
                &Message::new(
                    "alice",
                    model::ContentType::Text,
                    model::Payload::Text("up".into()),
                    model::RoutingInfo {
                        addressing_mode: model::AddressingMode::Topic,
                        target: "agents.status".into(),
                        priority: Default::default(),
                        ttl_seconds: None,
                    },
                    model::DeliveryOptions::default(),
                    Default::default(),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
