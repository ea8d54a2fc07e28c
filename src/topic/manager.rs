//! Topic Manager (§4.G): hierarchical topic lifecycle on top of the
//! Subscription Manager, backed by `topic:{id}` hashes and a
//! `topic_name:{name} -> id` lookup.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::component::{Component, ComponentStatus};
use crate::error::{MailboxError, Result};
use crate::kv::KvAdapter;
use crate::model::topic::MAX_HIERARCHY_DEPTH;
use crate::model::{Message, Subscription, SubscriptionOptions, Topic, TopicConfig};
use crate::subscription::SubscriptionManager;

fn topic_key(id: &str) -> String {
    format!("topic:{id}")
}
fn topic_name_key(name: &str) -> String {
    format!("topic_name:{name}")
}

pub struct TopicManager {
    kv: Arc<dyn KvAdapter>,
    subscriptions: Arc<SubscriptionManager>,
    topics: DashMap<String, Topic>,
    cleanup_after_default: std::time::Duration,
}

impl TopicManager {
    pub fn new(kv: Arc<dyn KvAdapter>, subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            kv,
            subscriptions,
            topics: DashMap::new(),
            cleanup_after_default: std::time::Duration::from_secs(24 * 3600),
        }
    }

    fn validate_name(name: &str) -> Result<()> {
        crate::model::validate_target(name)?;
        if crate::model::topic::Topic::depth(name) > MAX_HIERARCHY_DEPTH {
            return Err(MailboxError::Validation(format!(
                "topic '{name}' exceeds max hierarchy depth {MAX_HIERARCHY_DEPTH}"
            )));
        }
        Ok(())
    }

    pub async fn create_topic(&self, config: TopicConfig) -> Result<Topic> {
        Self::validate_name(&config.name)?;
        if self.kv.exists(&topic_name_key(&config.name)).await? {
            return Err(MailboxError::Conflict(format!(
                "topic '{}' already exists",
                config.name
            )));
        }
        let topic = self.materialize(config).await?;
        Ok(topic)
    }

    /// Creates the topic and, if hierarchical, its implicit ancestors —
    /// `a.b.c` materializes `a` and `a.b` first.
    async fn materialize(&self, config: TopicConfig) -> Result<Topic> {
        for parent in crate::model::topic::Topic::implicit_parents(&config.name) {
            if !self.kv.exists(&topic_name_key(&parent)).await? {
                let parent_config = TopicConfig::new(&parent);
                Box::pin(self.materialize(parent_config)).await?;
            }
        }

        let topic = Topic::from_config(config);
        self.persist(&topic).await?;
        self.kv
            .set(&topic_name_key(&topic.name), topic.id.to_string().into_bytes(), None)
            .await?;
        self.topics.insert(topic.id.to_string(), topic.clone());
        Ok(topic)
    }

    async fn persist(&self, topic: &Topic) -> Result<()> {
        let encoded = serde_json::to_vec(topic).map_err(|e| MailboxError::Validation(e.to_string()))?;
        self.kv.hset(&topic_key(&topic.id.to_string()), "record", encoded).await?;
        Ok(())
    }

    pub fn get_topic_by_name(&self, name: &str) -> Option<Topic> {
        self.topics.iter().find(|e| e.name == name).map(|e| e.value().clone())
    }

    /// Delegates to the Subscription Manager; when `include_children` is set
    /// on a hierarchical topic, the subscription pattern becomes `name.*`.
    pub async fn subscribe_to_topic(
        &self,
        agent_id: &str,
        name: &str,
        options: SubscriptionOptions,
        include_children: bool,
    ) -> Result<Subscription> {
        let topic = self
            .get_topic_by_name(name)
            .ok_or_else(|| MailboxError::NotFound(format!("topic '{name}' not found")))?;

        let pattern = include_children.then(|| format!("{name}.*"));

        let sub = self
            .subscriptions
            .create_subscription(agent_id, name, pattern, options)
            .await?;

        if let Some(mut t) = self.topics.get_mut(&topic.id.to_string()) {
            t.subscribers.insert(sub.id);
            t.updated_at = Utc::now();
        }
        Ok(sub)
    }

    /// Publishes to `topic:{name}`, returning the number of subscribers
    /// reached (the KV channel's subscriber count).
    pub async fn publish_to_topic(&self, name: &str, msg: &Message) -> Result<u64> {
        let topic = self
            .get_topic_by_name(name)
            .ok_or_else(|| MailboxError::NotFound(format!("topic '{name}' not found")))?;

        let channel = format!("topic:{name}");
        let body = msg.to_wire()?;
        let reached = self.kv.publish(&channel, body).await?;

        if let Some(mut t) = self.topics.get_mut(&topic.id.to_string()) {
            t.statistics.messages_published += 1;
            t.statistics.last_published_at = Some(Utc::now());
            t.updated_at = Utc::now();
            self.persist(&t).await?;
        }
        Ok(reached)
    }

    /// Hourly cleanup: deletes inactive, subscriber-less topics whose idle
    /// time exceeds `cleanup_after_hours`.
    pub async fn cleanup_tick(&self) -> Result<()> {
        let now = Utc::now();
        let stale: Vec<String> = self
            .topics
            .iter()
            .filter(|e| {
                let t = e.value();
                t.auto_cleanup
                    && t.subscribers.is_empty()
                    && (now - t.updated_at).num_seconds()
                        > chrono::Duration::hours(t.cleanup_after_hours as i64).num_seconds()
            })
            .map(|e| e.key().clone())
            .collect();

        for id in stale {
            if let Some((_, topic)) = self.topics.remove(&id) {
                debug!(topic = %topic.name, "removing inactive topic");
                self.kv.del(&topic_key(&id)).await?;
                self.kv.del(&topic_name_key(&topic.name)).await?;
            }
        }
        let _ = self.cleanup_after_default;
        Ok(())
    }
}

impl Component for TopicManager {
    fn status(&self) -> ComponentStatus {
        ComponentStatus::Healthy
    }

    fn health_indicators(&self) -> Vec<(&'static str, String)> {
        let subscriber_total: usize = self.topics.iter().map(|e| e.subscribers.len()).sum();
        vec![
            ("topics", self.topics.len().to_string()),
            ("topic_subscribers_total", subscriber_total.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::{AddressingMode, ContentType, DeliveryOptions, Payload, RoutingInfo};

    fn manager() -> TopicManager {
        let kv = Arc::new(MemoryKv::new());
        TopicManager::new(kv.clone(), Arc::new(SubscriptionManager::new(kv)))
    }

    fn msg() -> Message {
        Message::new(
            "alice",
            ContentType::Text,
            Payload::Text("hi".into()),
            RoutingInfo {
                addressing_mode: AddressingMode::Topic,
                target: "ai.models".into(),
                priority: Default::default(),
                ttl_seconds: None,
            },
            DeliveryOptions::default(),
            Default::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_topic_materializes_implicit_parents() {
        let m = manager();
        m.create_topic(TopicConfig::new("ai.models.gpt")).await.unwrap();
        assert!(m.get_topic_by_name("ai").is_some());
        assert!(m.get_topic_by_name("ai.models").is_some());
        assert!(m.get_topic_by_name("ai.models.gpt").is_some());
    }

    #[tokio::test]
    async fn create_topic_rejects_duplicate() {
        let m = manager();
        m.create_topic(TopicConfig::new("ai")).await.unwrap();
        let err = m.create_topic(TopicConfig::new("ai")).await.unwrap_err();
        assert!(matches!(err, MailboxError::Conflict(_)));
    }

    #[tokio::test]
    async fn subscribe_with_include_children_sets_wildcard_pattern() {
        let m = manager();
        m.create_topic(TopicConfig::new("ai.models")).await.unwrap();
        let sub = m
            .subscribe_to_topic("bob", "ai.models", SubscriptionOptions::default(), true)
            .await
            .unwrap();
        assert_eq!(sub.pattern.as_deref(), Some("ai.models.*"));
    }

    #[tokio::test]
    async fn publish_to_topic_reaches_subscribers() {
        let m = manager();
        m.create_topic(TopicConfig::new("ai.models")).await.unwrap();
        let mut kv_sub = m.kv.subscribe(&["topic:ai.models".to_string()]).await.unwrap();
        let reached = m.publish_to_topic("ai.models", &msg()).await.unwrap();
        assert_eq!(reached, 1);
        assert!(kv_sub.recv().await.unwrap().is_some());
    }
}
