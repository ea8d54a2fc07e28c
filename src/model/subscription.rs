//! `Subscription` and its delivery options (§3, §4.H).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::SubscriptionId;
use crate::model::mailbox::MessageFilter;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryMode {
    Realtime,
    Batch,
    Polling,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Realtime
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    pub message_filter: Option<MessageFilter>,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_true")]
    pub auto_ack: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}
fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_batch_timeout() -> u64 {
    DEFAULT_BATCH_TIMEOUT_SECS
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::default(),
            message_filter: None,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            auto_ack: true,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout_secs: DEFAULT_BATCH_TIMEOUT_SECS,
        }
    }
}

/// A subscription. Matching uses `target` exactly when `pattern` is `None`;
/// otherwise `pattern` drives matching per the rules in `delivery::pattern`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub agent_id: String,
    pub target: String,
    pub pattern: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub options: SubscriptionOptions,
    pub active: bool,
    pub message_count: u64,
}

impl Subscription {
    pub fn new(
        agent_id: impl Into<String>,
        target: impl Into<String>,
        pattern: Option<String>,
        options: SubscriptionOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SubscriptionId::new(),
            agent_id: agent_id.into(),
            target: target.into(),
            pattern,
            created_at: now,
            last_activity: now,
            options,
            active: true,
            message_count: 0,
        }
    }

    /// Identity used for the create-is-idempotent rule: same agent, target
    /// and pattern returns the existing subscription rather than a new one.
    pub fn identity_key(&self) -> (String, String, Option<String>) {
        (self.agent_id.clone(), self.target.clone(), self.pattern.clone())
    }
}

/// Per-agent connection/liveness state, owned by the Subscription Manager.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    pub reconnect_count: u32,
    pub outbox: std::collections::VecDeque<crate::model::message::Message>,
    /// When the outbox was last appended to, for BATCH mode's timeout flush.
    pub last_batch_append: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            connected: true,
            last_seen: Utc::now(),
            reconnect_count: 0,
            outbox: std::collections::VecDeque::new(),
            last_batch_append: None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
