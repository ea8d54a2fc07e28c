//! The `Message` record and its nested value objects (§3).

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MailboxError;
use crate::model::ids::MessageId;

/// Hard ceiling on the fully-serialized message (wire form), per §3.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 16 * 1024 * 1024;
/// Hard ceiling on the payload alone.
pub const MAX_PAYLOAD_SIZE_BYTES: usize = 15 * 1024 * 1024;
/// Ceiling for TEXT/CODE/MARKDOWN payloads (UTF-8 bytes).
pub const MAX_TEXT_PAYLOAD_BYTES: usize = 1024 * 1024;
/// Ceiling for JSON payloads once serialized.
pub const MAX_JSON_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;
/// Ceiling on serialized metadata.
pub const MAX_METADATA_BYTES: usize = 1024 * 1024;
/// Metadata keys with this prefix are reserved for the router's own enrichment.
pub const RESERVED_METADATA_PREFIX: &str = "_system_";
/// Max length of a metadata key.
pub const MAX_METADATA_KEY_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Text,
    Json,
    Binary,
    Code,
    Markdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AddressingMode {
    Direct,
    Broadcast,
    Topic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The message payload, typed by `ContentType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Canonical bytes used for hashing and size accounting.
    ///
    /// JSON is canonicalized via `serde_json`'s stable key ordering on the
    /// parsed value (not the original source text) so that two payloads that
    /// are structurally equal hash identically.
    pub fn canonical_bytes(&self, content_type: ContentType) -> Result<Vec<u8>, MailboxError> {
        match (self, content_type) {
            (Payload::Text(s), ContentType::Text | ContentType::Code | ContentType::Markdown) => {
                Ok(s.as_bytes().to_vec())
            }
            (Payload::Json(v), ContentType::Json) => serde_json::to_vec(v)
                .map_err(|e| MailboxError::Validation(format!("payload serialization: {e}"))),
            (Payload::Binary(b), ContentType::Binary) => Ok(b.clone()),
            _ => Err(MailboxError::Validation(
                "payload variant does not match content_type".into(),
            )),
        }
    }

    fn size_bytes(&self, content_type: ContentType) -> Result<usize, MailboxError> {
        Ok(self.canonical_bytes(content_type)?.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// No retries; a single delivery failure is terminal.
    None,
    /// Exponential backoff up to `max_retry_attempts` (see `router::RouterConfig`).
    Exponential,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub addressing_mode: AddressingMode,
    pub target: String,
    #[serde(default)]
    pub priority: Priority,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOptions {
    #[serde(default)]
    pub persistence: bool,
    #[serde(default)]
    pub confirmation_required: bool,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub encryption: Option<String>,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            persistence: true,
            confirmation_required: false,
            retry_policy: RetryPolicy::default(),
            encryption: None,
        }
    }
}

/// Application-level message metadata (the `_system_*` namespace is reserved
/// for router enrichment, see `enrich`).
pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: String,
    pub timestamp: DateTime<Utc>,
    pub content_type: ContentType,
    pub payload: Payload,
    #[serde(default)]
    pub metadata: Metadata,
    pub routing_info: RoutingInfo,
    #[serde(default)]
    pub delivery_options: DeliveryOptions,
    /// Hex-encoded SHA-256 of the canonical payload bytes.
    pub payload_hash: String,
}

impl Message {
    /// Build a new message, computing `payload_hash` from the payload.
    pub fn new(
        sender_id: impl Into<String>,
        content_type: ContentType,
        payload: Payload,
        routing_info: RoutingInfo,
        delivery_options: DeliveryOptions,
        metadata: Metadata,
    ) -> Result<Self, MailboxError> {
        let bytes = payload.canonical_bytes(content_type)?;
        let payload_hash = hex::encode(Sha256::digest(&bytes));
        Ok(Self {
            id: MessageId::new(),
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            content_type,
            payload,
            metadata,
            routing_info,
            delivery_options,
            payload_hash,
        })
    }

    /// Recompute the hash over the canonical payload bytes and compare
    /// against the stored `payload_hash` (testable property #1).
    pub fn verify_integrity(&self) -> Result<(), MailboxError> {
        let bytes = self.payload.canonical_bytes(self.content_type)?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual == self.payload_hash {
            Ok(())
        } else {
            Err(MailboxError::Integrity(format!(
                "payload_hash mismatch for message {}",
                self.id
            )))
        }
    }

    /// Structural validation against the §3 invariants. Does not check
    /// `payload_hash` (see `verify_integrity`) since a freshly-built message
    /// always has a correct hash; this only runs on inbound/deserialized
    /// messages.
    pub fn validate(&self) -> Result<(), MailboxError> {
        if self.sender_id.is_empty() {
            return Err(MailboxError::Validation("sender_id is required".into()));
        }
        crate::model::ids::validate_target(&self.routing_info.target)?;

        if let Some(ttl) = self.routing_info.ttl_seconds
            && ttl == 0
        {
            return Err(MailboxError::Validation(
                "ttl_seconds must be positive".into(),
            ));
        }

        let payload_len = self.payload.size_bytes(self.content_type)?;
        if payload_len > MAX_PAYLOAD_SIZE_BYTES {
            return Err(MailboxError::Validation(format!(
                "payload of {payload_len} bytes exceeds the {MAX_PAYLOAD_SIZE_BYTES} byte ceiling"
            )));
        }
        match self.content_type {
            ContentType::Text | ContentType::Code | ContentType::Markdown => {
                if payload_len > MAX_TEXT_PAYLOAD_BYTES {
                    return Err(MailboxError::Validation(format!(
                        "text payload of {payload_len} bytes exceeds {MAX_TEXT_PAYLOAD_BYTES} bytes"
                    )));
                }
            }
            ContentType::Json => {
                if payload_len > MAX_JSON_PAYLOAD_BYTES {
                    return Err(MailboxError::Validation(format!(
                        "json payload of {payload_len} bytes exceeds {MAX_JSON_PAYLOAD_BYTES} bytes"
                    )));
                }
            }
            ContentType::Binary => {}
        }

        for key in self.metadata.keys() {
            if key.len() > MAX_METADATA_KEY_LEN {
                return Err(MailboxError::Validation(format!(
                    "metadata key '{key}' exceeds {MAX_METADATA_KEY_LEN} chars"
                )));
            }
        }
        let metadata_len = serde_json::to_vec(&self.metadata)
            .map(|v| v.len())
            .unwrap_or(usize::MAX);
        if metadata_len > MAX_METADATA_BYTES {
            return Err(MailboxError::Validation(format!(
                "metadata of {metadata_len} bytes exceeds {MAX_METADATA_BYTES} bytes"
            )));
        }

        let total = self.wire_size_bytes()?;
        if total > MAX_MESSAGE_SIZE_BYTES {
            return Err(MailboxError::Validation(format!(
                "message of {total} bytes exceeds the {MAX_MESSAGE_SIZE_BYTES} byte ceiling"
            )));
        }

        Ok(())
    }

    /// Size of the full wire-encoded message (see `to_wire`).
    pub fn wire_size_bytes(&self) -> Result<usize, MailboxError> {
        Ok(self.to_wire()?.len())
    }

    /// True if `ttl_seconds` has elapsed since `timestamp` as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.routing_info.ttl_seconds {
            Some(ttl) => now >= self.timestamp + chrono::Duration::seconds(ttl as i64),
            None => false,
        }
    }

    /// Stamp `_system_*` enrichment metadata (§4.J step 2). Returns a clone;
    /// the router never mutates the message it was handed.
    pub fn enrich(&self, router_version: &str, now: DateTime<Utc>) -> Self {
        let mut enriched = self.clone();
        enriched.metadata.insert(
            "_system_routed_at".into(),
            serde_json::Value::String(now.to_rfc3339()),
        );
        enriched.metadata.insert(
            "_system_router_version".into(),
            serde_json::Value::String(router_version.into()),
        );
        enriched.metadata.insert(
            "_system_routing_mode".into(),
            serde_json::to_value(enriched.routing_info.addressing_mode)
                .unwrap_or(serde_json::Value::Null),
        );
        if enriched.routing_info.priority == Priority::Urgent {
            enriched
                .metadata
                .insert("_system_urgent".into(), serde_json::Value::Bool(true));
        }
        enriched
    }

    /// Encode per the exact wire format in §6: JSON-encoded subobjects as
    /// strings, ISO-8601 timestamp, content-type-dependent payload encoding,
    /// hex payload_hash, and a `version` field for forward compatibility.
    pub fn to_wire(&self) -> Result<Vec<u8>, MailboxError> {
        let payload_json = match (&self.payload, self.content_type) {
            (Payload::Text(s), ContentType::Text | ContentType::Code | ContentType::Markdown) => {
                serde_json::Value::String(s.clone())
            }
            (Payload::Json(v), ContentType::Json) => v.clone(),
            (Payload::Binary(b), ContentType::Binary) => {
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
            _ => {
                return Err(MailboxError::Validation(
                    "payload variant does not match content_type".into(),
                ));
            }
        };

        let wire = serde_json::json!({
            "version": "1.0",
            "id": self.id.0,
            "sender_id": self.sender_id,
            "timestamp": self.timestamp.to_rfc3339(),
            "content_type": self.content_type,
            "payload": payload_json,
            "metadata": serde_json::to_string(&self.metadata)
                .map_err(|e| MailboxError::Validation(e.to_string()))?,
            "routing_info": serde_json::to_string(&self.routing_info)
                .map_err(|e| MailboxError::Validation(e.to_string()))?,
            "delivery_options": serde_json::to_string(&self.delivery_options)
                .map_err(|e| MailboxError::Validation(e.to_string()))?,
            "payload_hash": self.payload_hash,
        });
        serde_json::to_vec(&wire).map_err(|e| MailboxError::Validation(e.to_string()))
    }

    /// Decode the §6 wire format and verify `payload_hash` on the way in
    /// (testable property #1 — a corrupt message is rejected, never
    /// silently accepted).
    pub fn from_wire(bytes: &[u8]) -> Result<Self, MailboxError> {
        let wire: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| MailboxError::Validation(format!("invalid wire message: {e}")))?;

        let get_str = |k: &str| -> Result<String, MailboxError> {
            wire.get(k)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| MailboxError::Validation(format!("wire message missing '{k}'")))
        };

        let id = parse_uuid(&get_str("id")?)?;
        let sender_id = get_str("sender_id")?;
        let timestamp = DateTime::parse_from_rfc3339(&get_str("timestamp")?)
            .map_err(|e| MailboxError::Validation(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc);
        let content_type: ContentType = serde_json::from_value(
            wire.get("content_type")
                .cloned()
                .ok_or_else(|| MailboxError::Validation("missing content_type".into()))?,
        )
        .map_err(|e| MailboxError::Validation(format!("bad content_type: {e}")))?;

        let payload = match content_type {
            ContentType::Text | ContentType::Code | ContentType::Markdown => {
                Payload::Text(get_str("payload")?)
            }
            ContentType::Json => Payload::Json(
                wire.get("payload")
                    .cloned()
                    .ok_or_else(|| MailboxError::Validation("missing payload".into()))?,
            ),
            ContentType::Binary => {
                let encoded = get_str("payload")?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| MailboxError::Validation(format!("bad base64 payload: {e}")))?;
                Payload::Binary(bytes)
            }
        };

        let metadata: Metadata = serde_json::from_str(&get_str("metadata")?)
            .map_err(|e| MailboxError::Validation(format!("bad metadata: {e}")))?;
        let routing_info: RoutingInfo = serde_json::from_str(&get_str("routing_info")?)
            .map_err(|e| MailboxError::Validation(format!("bad routing_info: {e}")))?;
        let delivery_options: DeliveryOptions = serde_json::from_str(&get_str("delivery_options")?)
            .map_err(|e| MailboxError::Validation(format!("bad delivery_options: {e}")))?;
        let payload_hash = get_str("payload_hash")?;

        let msg = Message {
            id: MessageId(id),
            sender_id,
            timestamp,
            content_type,
            payload,
            metadata,
            routing_info,
            delivery_options,
            payload_hash,
        };
        msg.verify_integrity()?;
        Ok(msg)
    }
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid, MailboxError> {
    uuid::Uuid::parse_str(s).map_err(|e| MailboxError::Validation(format!("bad uuid: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing(target: &str) -> RoutingInfo {
        RoutingInfo {
            addressing_mode: AddressingMode::Direct,
            target: target.into(),
            priority: Priority::Normal,
            ttl_seconds: None,
        }
    }

    #[test]
    fn round_trip_preserves_structural_equality() {
        let msg = Message::new(
            "alpha",
            ContentType::Text,
            Payload::Text("hi".into()),
            routing("inbox-bravo"),
            DeliveryOptions::default(),
            Metadata::new(),
        )
        .unwrap();

        let wire = msg.to_wire().unwrap();
        let decoded = Message::from_wire(&wire).unwrap();

        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.sender_id, msg.sender_id);
        assert_eq!(decoded.payload_hash, msg.payload_hash);
        match decoded.payload {
            Payload::Text(s) => assert_eq!(s, "hi"),
            _ => panic!("expected text payload"),
        }
    }

    #[test]
    fn tampered_payload_fails_integrity_check() {
        let mut msg = Message::new(
            "alpha",
            ContentType::Text,
            Payload::Text("hi".into()),
            routing("inbox-bravo"),
            DeliveryOptions::default(),
            Metadata::new(),
        )
        .unwrap();
        msg.payload = Payload::Text("tampered".into());
        assert!(msg.verify_integrity().is_err());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mut routing_info = routing("inbox-bravo");
        routing_info.ttl_seconds = Some(0);
        let msg = Message::new(
            "alpha",
            ContentType::Text,
            Payload::Text("hi".into()),
            routing_info,
            DeliveryOptions::default(),
            Metadata::new(),
        )
        .unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn one_second_ttl_expires_after_one_second() {
        let mut routing_info = routing("inbox-bravo");
        routing_info.ttl_seconds = Some(1);
        let msg = Message::new(
            "alpha",
            ContentType::Text,
            Payload::Text("hi".into()),
            routing_info,
            DeliveryOptions::default(),
            Metadata::new(),
        )
        .unwrap();
        assert!(!msg.is_expired(msg.timestamp));
        assert!(msg.is_expired(msg.timestamp + chrono::Duration::seconds(1)));
    }

    #[test]
    fn oversized_text_payload_is_rejected() {
        let big = "x".repeat(MAX_TEXT_PAYLOAD_BYTES + 1);
        let msg = Message::new(
            "alpha",
            ContentType::Text,
            Payload::Text(big),
            routing("inbox-bravo"),
            DeliveryOptions::default(),
            Metadata::new(),
        )
        .unwrap();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn enrich_stamps_system_metadata_without_mutating_original() {
        let msg = Message::new(
            "alpha",
            ContentType::Text,
            Payload::Text("hi".into()),
            routing("inbox-bravo"),
            DeliveryOptions::default(),
            Metadata::new(),
        )
        .unwrap();
        let enriched = msg.enrich("1.0", Utc::now());
        assert!(enriched.metadata.contains_key("_system_routed_at"));
        assert!(!msg.metadata.contains_key("_system_routed_at"));
    }
}
