//! Mailbox Storage (§4.E): durable message persistence over the KV Adapter.
//!
//! Key layout (logical; `KvAdapter` encodes it):
//! - `mailbox:{name}:metadata` — hash, the `MailboxMetadata` record.
//! - `mailbox:{name}:messages` — sorted set, score = unix-seconds, message order.
//! - `mailbox:{name}:message_data` — hash, `msg_id` -> JSON message body.
//! - `mailbox:{name}:read_status` — hash, `{msg_id}:{agent_id}` -> ISO timestamp.
//! - `mailbox_index` — set of all mailbox names.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::error::{MailboxError, Result};
use crate::kv::KvAdapter;
use crate::model::{MailboxMetadata, MailboxState, Message, MessageFilter};

fn metadata_key(mailbox: &str) -> String {
    format!("mailbox:{mailbox}:metadata")
}
fn messages_key(mailbox: &str) -> String {
    format!("mailbox:{mailbox}:messages")
}
fn message_data_key(mailbox: &str) -> String {
    format!("mailbox:{mailbox}:message_data")
}
fn read_status_key(mailbox: &str) -> String {
    format!("mailbox:{mailbox}:read_status")
}
const MAILBOX_INDEX_KEY: &str = "mailbox_index";

pub struct MessagePage {
    pub messages: Vec<Message>,
    pub total_count: u64,
    pub has_more: bool,
}

pub struct MailboxStore {
    kv: Arc<dyn KvAdapter>,
}

impl MailboxStore {
    pub fn new(kv: Arc<dyn KvAdapter>) -> Self {
        Self { kv }
    }

    pub async fn create_mailbox(
        &self,
        name: &str,
        creator: &str,
    ) -> Result<MailboxMetadata> {
        if self.kv.sismember(MAILBOX_INDEX_KEY, name).await? {
            return Err(MailboxError::Conflict(format!(
                "mailbox '{name}' already exists"
            )));
        }
        let metadata = MailboxMetadata::new(name, creator);
        self.write_metadata(name, &metadata).await?;
        self.kv.sadd(MAILBOX_INDEX_KEY, name).await?;
        Ok(metadata)
    }

    async fn ensure_mailbox(&self, name: &str, creator: &str) -> Result<()> {
        if !self.kv.sismember(MAILBOX_INDEX_KEY, name).await? {
            let metadata = MailboxMetadata::new(name, creator);
            self.write_metadata(name, &metadata).await?;
            self.kv.sadd(MAILBOX_INDEX_KEY, name).await?;
        }
        Ok(())
    }

    async fn read_metadata(&self, name: &str) -> Result<Option<MailboxMetadata>> {
        let fields = self.kv.hgetall(&metadata_key(name)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let map: std::collections::HashMap<String, Vec<u8>> = fields.into_iter().collect();
        let raw = map
            .get("record")
            .ok_or_else(|| MailboxError::Validation("mailbox record missing".into()))?;
        Ok(Some(serde_json::from_slice(raw).map_err(|e| {
            MailboxError::Validation(format!("corrupt mailbox metadata: {e}"))
        })?))
    }

    async fn write_metadata(&self, name: &str, metadata: &MailboxMetadata) -> Result<()> {
        let encoded = serde_json::to_vec(metadata)
            .map_err(|e| MailboxError::Validation(e.to_string()))?;
        self.kv
            .hset(&metadata_key(name), "record", encoded)
            .await?;
        Ok(())
    }

    /// Auto-creates the mailbox if absent, writes the message body, adds it
    /// to the ordered set, and trims the oldest entries past `max_messages`.
    pub async fn store_message(&self, mailbox: &str, msg: &Message) -> Result<()> {
        self.ensure_mailbox(mailbox, &msg.sender_id).await?;

        let body = msg.to_wire()?;
        let score = msg.timestamp.timestamp() as f64;
        self.kv
            .hset(&message_data_key(mailbox), &msg.id.to_string(), body.clone())
            .await?;
        self.kv
            .zadd(&messages_key(mailbox), &msg.id.to_string(), score)
            .await?;

        let mut metadata = self
            .read_metadata(mailbox)
            .await?
            .ok_or_else(|| MailboxError::NotFound(format!("mailbox '{mailbox}' not found")))?;
        metadata.message_count += 1;
        metadata.total_size_bytes += body.len() as u64;
        metadata.last_activity = Some(Utc::now());

        if let Some(ttl) = metadata.message_ttl_seconds {
            self.kv
                .expire(&message_data_key(mailbox), std::time::Duration::from_secs(ttl))
                .await?;
        }

        if metadata.message_count > metadata.max_messages {
            self.trim_oldest(mailbox, &mut metadata).await?;
        }

        self.write_metadata(mailbox, &metadata).await?;
        Ok(())
    }

    async fn trim_oldest(&self, mailbox: &str, metadata: &mut MailboxMetadata) -> Result<()> {
        let overflow = metadata.message_count - metadata.max_messages;
        let oldest = self
            .kv
            .zrange(&messages_key(mailbox), 0, overflow as i64 - 1)
            .await?;
        for (msg_id, _) in oldest {
            if let Some(body) = self.kv.hget(&message_data_key(mailbox), &msg_id).await? {
                metadata.total_size_bytes = metadata.total_size_bytes.saturating_sub(body.len() as u64);
            }
            self.kv.hdel(&message_data_key(mailbox), &msg_id).await?;
            self.kv.zrem(&messages_key(mailbox), &msg_id).await?;
            metadata.message_count = metadata.message_count.saturating_sub(1);
        }
        Ok(())
    }

    /// Paginate by range over the ordered set, hydrate bodies, then apply
    /// `filter` in-memory.
    pub async fn get_messages(
        &self,
        mailbox: &str,
        offset: u64,
        limit: u64,
        filter: Option<&MessageFilter>,
        reverse: bool,
    ) -> Result<MessagePage> {
        let total_count = self.kv.zcard(&messages_key(mailbox)).await?;
        let start = offset as i64;
        let stop = (offset + limit) as i64 - 1;
        let ids = if reverse {
            self.kv.zrevrange(&messages_key(mailbox), start, stop).await?
        } else {
            self.kv.zrange(&messages_key(mailbox), start, stop).await?
        };

        let metadata = self.read_metadata(mailbox).await?;
        let tags = metadata.map(|m| m.tags).unwrap_or_default();

        let mut messages = Vec::with_capacity(ids.len());
        for (msg_id, _) in &ids {
            let Some(body) = self.kv.hget(&message_data_key(mailbox), msg_id).await? else {
                continue;
            };
            let msg = Message::from_wire(&body)?;
            if filter.is_none_or(|f| f.matches(&msg, &tags)) {
                messages.push(msg);
            }
        }

        let has_more = offset + (ids.len() as u64) < total_count;
        Ok(MessagePage {
            messages,
            total_count,
            has_more,
        })
    }

    pub async fn get_message(&self, mailbox: &str, msg_id: &str) -> Result<Option<Message>> {
        let Some(body) = self.kv.hget(&message_data_key(mailbox), msg_id).await? else {
            return Ok(None);
        };
        Ok(Some(Message::from_wire(&body)?))
    }

    pub async fn delete_message(&self, mailbox: &str, msg_id: &str) -> Result<bool> {
        let removed_body = self.kv.hget(&message_data_key(mailbox), msg_id).await?;
        let removed = self.kv.hdel(&message_data_key(mailbox), msg_id).await?;
        self.kv.zrem(&messages_key(mailbox), msg_id).await?;
        if removed
            && let Some(body) = removed_body
            && let Some(mut metadata) = self.read_metadata(mailbox).await?
        {
            metadata.message_count = metadata.message_count.saturating_sub(1);
            metadata.total_size_bytes = metadata.total_size_bytes.saturating_sub(body.len() as u64);
            self.write_metadata(mailbox, &metadata).await?;
        }
        Ok(removed)
    }

    pub async fn mark_message_read(&self, mailbox: &str, msg_id: &str, agent_id: &str) -> Result<bool> {
        if self.get_message(mailbox, msg_id).await?.is_none() {
            return Ok(false);
        }
        let field = format!("{msg_id}:{agent_id}");
        self.kv
            .hset(
                &read_status_key(mailbox),
                &field,
                Utc::now().to_rfc3339().into_bytes(),
            )
            .await?;
        Ok(true)
    }

    pub async fn is_message_read(&self, mailbox: &str, msg_id: &str, agent_id: &str) -> Result<bool> {
        let field = format!("{msg_id}:{agent_id}");
        Ok(self.kv.hget(&read_status_key(mailbox), &field).await?.is_some())
    }

    /// Scans the ordered set and checks read markers per §4.E.
    pub async fn get_unread_count(&self, mailbox: &str, agent_id: &str) -> Result<u64> {
        let all = self.kv.zrange(&messages_key(mailbox), 0, -1).await?;
        let mut unread = 0u64;
        for (msg_id, _) in all {
            if !self.is_message_read(mailbox, &msg_id, agent_id).await? {
                unread += 1;
            }
        }
        Ok(unread)
    }

    /// Replays all stored messages for `mailbox` with a timestamp at or
    /// after `since` (§10 supplement — used for reconnect/offline replay).
    pub async fn replay(&self, mailbox: &str, since: chrono::DateTime<Utc>) -> Result<Vec<Message>> {
        let min_score = since.timestamp() as f64;
        let ids = self
            .kv
            .zrangebyscore(&messages_key(mailbox), min_score, f64::MAX)
            .await?;
        let mut out = Vec::with_capacity(ids.len());
        for (msg_id, _) in ids {
            if let Some(body) = self.kv.hget(&message_data_key(mailbox), &msg_id).await? {
                match Message::from_wire(&body) {
                    Ok(msg) => out.push(msg),
                    Err(e) => warn!(mailbox, msg_id, error = %e, "skipping corrupt message during replay"),
                }
            }
        }
        Ok(out)
    }

    pub async fn list_mailboxes(&self) -> Result<Vec<String>> {
        Ok(self.kv.smembers(MAILBOX_INDEX_KEY).await?)
    }

    pub async fn mailbox_state(&self, name: &str) -> Result<Option<MailboxState>> {
        Ok(self.read_metadata(name).await?.map(|m| m.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::{AddressingMode, ContentType, DeliveryOptions, Payload, RoutingInfo};

    fn store() -> MailboxStore {
        MailboxStore::new(Arc::new(MemoryKv::new()))
    }

    fn text_message(target: &str, sender: &str) -> Message {
        Message::new(
            sender,
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
    async fn create_mailbox_rejects_duplicate() {
        let store = store();
        store.create_mailbox("inbox", "alice").await.unwrap();
        let err = store.create_mailbox("inbox", "alice").await.unwrap_err();
        assert!(matches!(err, MailboxError::Conflict(_)));
    }

    #[tokio::test]
    async fn store_and_retrieve_round_trips() {
        let store = store();
        let msg = text_message("inbox", "alice");
        store.store_message("inbox", &msg).await.unwrap();
        let fetched = store.get_message("inbox", &msg.id.to_string()).await.unwrap();
        assert_eq!(fetched.unwrap().id, msg.id);
    }

    #[tokio::test]
    async fn store_message_auto_creates_mailbox() {
        let store = store();
        let msg = text_message("fresh", "alice");
        store.store_message("fresh", &msg).await.unwrap();
        assert!(store.list_mailboxes().await.unwrap().contains(&"fresh".to_string()));
    }

    #[tokio::test]
    async fn unread_count_reflects_read_marks() {
        let store = store();
        let msg = text_message("inbox", "alice");
        store.store_message("inbox", &msg).await.unwrap();
        assert_eq!(store.get_unread_count("inbox", "bob").await.unwrap(), 1);
        store
            .mark_message_read("inbox", &msg.id.to_string(), "bob")
            .await
            .unwrap();
        assert_eq!(store.get_unread_count("inbox", "bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trims_oldest_past_max_messages() {
        let store = store();
        store.create_mailbox("inbox", "alice").await.unwrap();
        {
            let meta_key = metadata_key("inbox");
            let mut metadata = store.read_metadata("inbox").await.unwrap().unwrap();
            metadata.max_messages = 2;
            let encoded = serde_json::to_vec(&metadata).unwrap();
            store.kv.hset(&meta_key, "record", encoded).await.unwrap();
        }
        for _ in 0..3 {
            let msg = text_message("inbox", "alice");
            store.store_message("inbox", &msg).await.unwrap();
        }
        let page = store.get_messages("inbox", 0, 10, None, true).await.unwrap();
        assert_eq!(page.messages.len(), 2);
    }
}
