//! `OfflineMessage` and `ReadStatus` (§3, §4.F).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::MessageId;
use crate::model::message::Message;

pub const DEFAULT_OFFLINE_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OfflineStatus {
    Queued,
    Delivered,
    Read,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMessage {
    pub message: Message,
    pub queued_at: DateTime<Utc>,
    pub target_agent: String,
    pub mailbox_name: String,
    pub status: OfflineStatus,
    pub delivery_attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OfflineMessage {
    pub fn new(
        message: Message,
        target_agent: impl Into<String>,
        mailbox_name: impl Into<String>,
        ttl_secs: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            message,
            queued_at: now,
            target_agent: target_agent.into(),
            mailbox_name: mailbox_name.into(),
            status: OfflineStatus::Queued,
            delivery_attempts: 0,
            last_attempt: None,
            expires_at: ttl_secs.map(|t| now + chrono::Duration::seconds(t as i64)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadStatus {
    pub message_id: MessageId,
    pub agent_id: String,
    pub read_at: DateTime<Utc>,
    pub mailbox_name: String,
}
