//! `Topic` metadata (§3, §4.G).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{SubscriptionId, TopicId};

pub const DEFAULT_MAX_SUBSCRIBERS: u32 = 1000;
pub const DEFAULT_CLEANUP_AFTER_HOURS: u64 = 24;
pub const MAX_HIERARCHY_DEPTH: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicStatistics {
    pub messages_published: u64,
    pub last_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub description: Option<String>,
    pub parent_topic: Option<String>,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    #[serde(default = "default_cleanup_after_hours")]
    pub cleanup_after_hours: u64,
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: u32,
    pub message_retention_hours: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub permissions: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}
fn default_cleanup_after_hours() -> u64 {
    DEFAULT_CLEANUP_AFTER_HOURS
}
fn default_max_subscribers() -> u32 {
    DEFAULT_MAX_SUBSCRIBERS
}

impl TopicConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parent_topic: None,
            auto_cleanup: true,
            cleanup_after_hours: DEFAULT_CLEANUP_AFTER_HOURS,
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            message_retention_hours: None,
            metadata: HashMap::new(),
            permissions: HashMap::new(),
        }
    }
}

/// A topic. Subscribers are stored by `SubscriptionId` only, never by
/// pointer, to avoid a `Topic` <-> `Subscription` ownership cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub description: Option<String>,
    pub parent_topic: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
    pub auto_cleanup: bool,
    pub cleanup_after_hours: u64,
    pub max_subscribers: u32,
    pub message_retention_hours: Option<u64>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub permissions: HashMap<String, serde_json::Value>,
    pub statistics: TopicStatistics,
    #[serde(default)]
    pub subscribers: HashSet<SubscriptionId>,
}

impl Topic {
    pub fn from_config(config: TopicConfig) -> Self {
        let now = Utc::now();
        Self {
            id: TopicId::new(),
            name: config.name,
            description: config.description,
            parent_topic: config.parent_topic,
            created_at: now,
            updated_at: now,
            active: true,
            auto_cleanup: config.auto_cleanup,
            cleanup_after_hours: config.cleanup_after_hours,
            max_subscribers: config.max_subscribers,
            message_retention_hours: config.message_retention_hours,
            metadata: config.metadata,
            permissions: config.permissions,
            statistics: TopicStatistics::default(),
            subscribers: HashSet::new(),
        }
    }

    /// A topic is hierarchical if its name contains a `.`.
    pub fn is_hierarchical(&self) -> bool {
        self.name.contains('.')
    }

    /// Implicit parent names that must exist for this topic, e.g.
    /// `a.b.c` materializes `a` and `a.b`.
    pub fn implicit_parents(name: &str) -> Vec<String> {
        let segments: Vec<&str> = name.split('.').collect();
        (1..segments.len())
            .map(|i| segments[..i].join("."))
            .collect()
    }

    pub fn depth(name: &str) -> usize {
        name.split('.').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_parents_materializes_each_ancestor() {
        assert_eq!(
            Topic::implicit_parents("a.b.c"),
            vec!["a".to_string(), "a.b".to_string()]
        );
        assert!(Topic::implicit_parents("a").is_empty());
    }

    #[test]
    fn hierarchical_detection() {
        let t = Topic::from_config(TopicConfig::new("ai.models.gpt"));
        assert!(t.is_hierarchical());
        let t2 = Topic::from_config(TopicConfig::new("ai"));
        assert!(!t2.is_hierarchical());
    }
}
