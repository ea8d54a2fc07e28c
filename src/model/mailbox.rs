//! `Mailbox` metadata and the unified message filter schema (§3, §4.E).
//!
//! Per §9's Open Questions, the storage-level and
//! subscription-level `MessageFilter` shapes are treated as one schema:
//! the union of both fields. Unknown fields are rejected by `serde`'s
//! default `deny_unknown_fields` behavior on the wire-facing variant;
//! the in-memory type below is what every component actually builds and
//! matches against.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::message::{ContentType, Message, Priority};

pub const DEFAULT_MAX_MESSAGES: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MailboxState {
    Active,
    Inactive,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub state: MailboxState,
    pub description: Option<String>,
    pub max_messages: u64,
    pub message_ttl_seconds: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub total_size_bytes: u64,
    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_metadata: HashMap<String, serde_json::Value>,
}

impl MailboxMetadata {
    pub fn new(name: impl Into<String>, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            created_at: now,
            created_by: created_by.into(),
            state: MailboxState::Active,
            description: None,
            max_messages: DEFAULT_MAX_MESSAGES,
            message_ttl_seconds: None,
            last_activity: Some(now),
            message_count: 0,
            total_size_bytes: 0,
            subscribers: Vec::new(),
            tags: Vec::new(),
            custom_metadata: HashMap::new(),
        }
    }
}

/// Union of the storage-level and subscription-level filter fields
/// (spec §9 Open Questions). Tag matching requires *all* listed tags to be
/// present (`tags.md.E`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageFilter {
    pub sender_id: Option<String>,
    pub content_type: Option<ContentType>,
    /// Minimum priority; a candidate must be `>= min_priority`.
    pub min_priority: Option<Priority>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
    /// Substring match against the serialized payload (subscription-level
    /// keyword filter).
    pub keyword: Option<String>,
    /// Subscription-level filter: only these content types are admitted.
    pub content_types: Option<Vec<ContentType>>,
}

impl MessageFilter {
    pub fn matches(&self, msg: &Message, mailbox_tags: &[String]) -> bool {
        if let Some(sender) = &self.sender_id
            && &msg.sender_id != sender
        {
            return false;
        }
        if let Some(ct) = self.content_type
            && msg.content_type != ct
        {
            return false;
        }
        if let Some(types) = &self.content_types
            && !types.contains(&msg.content_type)
        {
            return false;
        }
        if let Some(min) = self.min_priority
            && msg.routing_info.priority < min
        {
            return false;
        }
        if let Some(start) = self.start_time
            && msg.timestamp < start
        {
            return false;
        }
        if let Some(end) = self.end_time
            && msg.timestamp > end
        {
            return false;
        }
        if let Some(tags) = &self.tags
            && !tags.iter().all(|t| mailbox_tags.contains(t))
        {
            return false;
        }
        if let Some(keyword) = &self.keyword {
            let serialized = serde_json::to_string(&msg.payload).unwrap_or_default();
            if !serialized.to_lowercase().contains(&keyword.to_lowercase()) {
                return false;
            }
        }
        true
    }
}
