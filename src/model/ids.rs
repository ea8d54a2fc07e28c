//! Identifier newtypes and the validation rules from the data model.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MailboxError;

static AGENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));
static TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,256}$").expect("static regex"));

/// `MessageID` — UUID v4 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `SubscriptionID` — UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `TopicID` — UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub Uuid);

impl TopicId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TopicId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parses a message id out of its string form (wire/storage key form).
pub fn parse_message_id(s: &str) -> Result<MessageId, MailboxError> {
    Uuid::parse_str(s)
        .map(MessageId)
        .map_err(|e| MailboxError::Validation(format!("invalid message id '{s}': {e}")))
}

/// `AgentID` — 1-64 chars, `[A-Za-z0-9_-]`.
pub fn validate_agent_id(id: &str) -> Result<(), MailboxError> {
    if AGENT_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(MailboxError::Validation(format!(
            "agent id '{id}' must be 1-64 chars of [A-Za-z0-9_-]"
        )))
    }
}

/// `Target` — 1-256 chars, `[A-Za-z0-9._-]`.
pub fn validate_target(target: &str) -> Result<(), MailboxError> {
    if TARGET_RE.is_match(target) {
        Ok(())
    } else {
        Err(MailboxError::Validation(format!(
            "target '{target}' must be 1-256 chars of [A-Za-z0-9._-]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_agent_ids() {
        assert!(validate_agent_id("alpha-1").is_ok());
        assert!(validate_agent_id("a").is_ok());
    }

    #[test]
    fn rejects_malformed_agent_ids() {
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("has space").is_err());
        assert!(validate_agent_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn accepts_hierarchical_targets() {
        assert!(validate_target("ai.models.gpt").is_ok());
        assert!(validate_target("inbox-bravo").is_ok());
    }

    #[test]
    fn rejects_malformed_targets() {
        assert!(validate_target("").is_err());
        assert!(validate_target("has space").is_err());
    }
}
