//! Offline Message Handler (§4.F): per-agent queues for agents without a
//! live connection, plus read-state indices shared with the Subscription
//! Manager's reconnect-flush path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::kv::KvAdapter;
use crate::model::{MessageFilter, OfflineMessage, OfflineStatus, ReadStatus};

const DEFAULT_QUEUE_CAPACITY: u64 = 1_000;
const READ_STATUS_MAX_AGE_DAYS: i64 = 30;

fn offline_queue_key(agent: &str) -> String {
    format!("offline_queue:{agent}")
}
fn offline_message_key(msg_id: &str, agent: &str) -> String {
    format!("offline_message:{msg_id}:{agent}")
}
fn read_status_key(agent: &str, mailbox: &str, msg_id: &str) -> String {
    format!("read_status:{agent}:{mailbox}:{msg_id}")
}
fn agent_read_index_key(agent: &str) -> String {
    format!("agent_read_index:{agent}")
}
fn message_readers_key(msg_id: &str) -> String {
    format!("message_readers:{msg_id}")
}

pub struct OfflineHandler {
    kv: Arc<dyn KvAdapter>,
    max_queue_per_agent: u64,
}

impl OfflineHandler {
    pub fn new(kv: Arc<dyn KvAdapter>) -> Self {
        Self {
            kv,
            max_queue_per_agent: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub async fn queue_for_offline(
        &self,
        msg: &crate::model::Message,
        agent: &str,
        mailbox: &str,
        ttl: Option<std::time::Duration>,
    ) -> Result<()> {
        let offline = OfflineMessage::new(
            msg.clone(),
            agent,
            mailbox,
            ttl.map(|d| d.as_secs())
                .or(Some(crate::model::offline::DEFAULT_OFFLINE_TTL_SECS)),
        );
        let encoded =
            serde_json::to_vec(&offline).map_err(|e| crate::error::MailboxError::Validation(e.to_string()))?;
        let key = offline_message_key(&msg.id.to_string(), agent);
        self.kv.hset(&key, "record", encoded).await?;
        if let Some(ttl) = ttl {
            self.kv.expire(&key, ttl).await?;
        }

        self.kv
            .zadd(
                &offline_queue_key(agent),
                &msg.id.to_string(),
                offline.queued_at.timestamp() as f64,
            )
            .await?;

        let queue_len = self.kv.zcard(&offline_queue_key(agent)).await?;
        if queue_len > self.max_queue_per_agent {
            let overflow = queue_len - self.max_queue_per_agent;
            let oldest = self
                .kv
                .zrange(&offline_queue_key(agent), 0, overflow as i64 - 1)
                .await?;
            for (old_id, _) in oldest {
                debug!(agent, msg_id = %old_id, "dropping oldest offline entry (queue full)");
                self.kv.zrem(&offline_queue_key(agent), &old_id).await?;
                self.kv.del(&offline_message_key(&old_id, agent)).await?;
            }
        }
        Ok(())
    }

    /// Dequeues newest-first, skipping orphaned entries whose body has
    /// expired or was separately deleted.
    pub async fn get_queued(
        &self,
        agent: &str,
        limit: u64,
        offset: u64,
        filter: Option<&MessageFilter>,
    ) -> Result<Vec<OfflineMessage>> {
        let ids = self
            .kv
            .zrevrange(&offline_queue_key(agent), offset as i64, (offset + limit) as i64 - 1)
            .await?;
        let mut out = Vec::with_capacity(ids.len());
        for (msg_id, _) in ids {
            let key = offline_message_key(&msg_id, agent);
            let Some(body) = self.kv.hget(&key, "record").await? else {
                self.kv.zrem(&offline_queue_key(agent), &msg_id).await?;
                continue;
            };
            let Ok(offline): std::result::Result<OfflineMessage, _> = serde_json::from_slice(&body) else {
                continue;
            };
            if offline.is_expired(Utc::now()) {
                self.kv.zrem(&offline_queue_key(agent), &msg_id).await?;
                self.kv.del(&key).await?;
                continue;
            }
            if filter.is_none_or(|f| f.matches(&offline.message, &[])) {
                out.push(offline);
            }
        }
        Ok(out)
    }

    pub async fn mark_delivered(&self, msg_id: &str, agent: &str) -> Result<()> {
        let key = offline_message_key(msg_id, agent);
        if let Some(body) = self.kv.hget(&key, "record").await? {
            if let Ok(mut offline) = serde_json::from_slice::<OfflineMessage>(&body) {
                offline.status = OfflineStatus::Delivered;
                offline.delivery_attempts += 1;
                offline.last_attempt = Some(Utc::now());
                let encoded = serde_json::to_vec(&offline)
                    .map_err(|e| crate::error::MailboxError::Validation(e.to_string()))?;
                self.kv.hset(&key, "record", encoded).await?;
            }
        }
        Ok(())
    }

    pub async fn remove_delivered(&self, agent: &str, msg_ids: &[String]) -> Result<()> {
        for msg_id in msg_ids {
            self.kv.zrem(&offline_queue_key(agent), msg_id).await?;
            self.kv.del(&offline_message_key(msg_id, agent)).await?;
        }
        Ok(())
    }

    pub async fn mark_read(&self, mailbox: &str, msg_id: &str, agent: &str) -> Result<()> {
        let status = ReadStatus {
            message_id: crate::model::ids::parse_message_id(msg_id)?,
            agent_id: agent.to_string(),
            read_at: Utc::now(),
            mailbox_name: mailbox.to_string(),
        };
        let encoded =
            serde_json::to_vec(&status).map_err(|e| crate::error::MailboxError::Validation(e.to_string()))?;
        self.kv
            .hset(&read_status_key(agent, mailbox, msg_id), "record", encoded)
            .await?;
        self.kv.sadd(&agent_read_index_key(agent), msg_id).await?;
        self.kv.sadd(&message_readers_key(msg_id), agent).await?;
        Ok(())
    }

    pub async fn by_time_range(
        &self,
        mailbox_store: &crate::storage::MailboxStore,
        mailbox: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<crate::model::Message>> {
        let page = mailbox_store.get_messages(mailbox, 0, u64::MAX, None, false).await?;
        Ok(page
            .messages
            .into_iter()
            .filter(|m| m.timestamp >= start && m.timestamp <= end)
            .collect())
    }

    pub async fn by_id_range(
        &self,
        mailbox_store: &crate::storage::MailboxStore,
        mailbox: &str,
        start_id: Option<&str>,
        end_id: Option<&str>,
    ) -> Result<Vec<crate::model::Message>> {
        let page = mailbox_store.get_messages(mailbox, 0, u64::MAX, None, false).await?;
        let mut started = start_id.is_none();
        let mut out = Vec::new();
        for msg in page.messages {
            let id = msg.id.to_string();
            if !started {
                if id == start_id.unwrap() {
                    started = true;
                } else {
                    continue;
                }
            }
            out.push(msg);
            if end_id.is_some_and(|e| e == id) {
                break;
            }
        }
        Ok(out)
    }

    /// Latest `read_at` across the agent's read index, then a time-range
    /// query after that (§4.F).
    pub async fn since_last_read(
        &self,
        mailbox_store: &crate::storage::MailboxStore,
        mailbox: &str,
        agent: &str,
    ) -> Result<Vec<crate::model::Message>> {
        let read_ids = self.kv.smembers(&agent_read_index_key(agent)).await?;
        let mut latest: Option<DateTime<Utc>> = None;
        for msg_id in read_ids {
            let key = read_status_key(agent, mailbox, &msg_id);
            if let Some(body) = self.kv.hget(&key, "record").await?
                && let Ok(status) = serde_json::from_slice::<ReadStatus>(&body)
                && latest.is_none_or(|l| status.read_at > l)
            {
                latest = Some(status.read_at);
            }
        }
        let since = latest.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
        self.by_time_range(mailbox_store, mailbox, since, Utc::now()).await
    }

    /// Hourly cleanup: prune expired offline entries and read-status records
    /// older than 30 days.
    pub async fn cleanup(&self, agents: &[String]) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(READ_STATUS_MAX_AGE_DAYS);
        for agent in agents {
            let ids = self.kv.zrange(&offline_queue_key(agent), 0, -1).await?;
            for (msg_id, _) in ids {
                let key = offline_message_key(&msg_id, agent);
                match self.kv.hget(&key, "record").await? {
                    Some(body) => {
                        if let Ok(offline) = serde_json::from_slice::<OfflineMessage>(&body)
                            && offline.is_expired(Utc::now())
                        {
                            self.kv.zrem(&offline_queue_key(agent), &msg_id).await?;
                            self.kv.del(&key).await?;
                        }
                    }
                    None => {
                        self.kv.zrem(&offline_queue_key(agent), &msg_id).await?;
                    }
                }
            }

            let read_ids = self.kv.smembers(&agent_read_index_key(agent)).await?;
            for msg_id in read_ids {
                let pattern = format!("read_status:{agent}:*:{msg_id}");
                for key in self.kv.keys(&pattern).await? {
                    let Some(body) = self.kv.hget(&key, "record").await? else {
                        continue;
                    };
                    let Ok(status) = serde_json::from_slice::<ReadStatus>(&body) else {
                        continue;
                    };
                    if status.read_at < cutoff {
                        self.kv.del(&key).await?;
                        self.kv.srem(&agent_read_index_key(agent), &msg_id).await?;
                        self.kv.srem(&message_readers_key(&msg_id), agent).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::model::{AddressingMode, ContentType, DeliveryOptions, Message, Payload, RoutingInfo};

    fn handler() -> OfflineHandler {
        OfflineHandler::new(Arc::new(MemoryKv::new()))
    }

    fn msg() -> Message {
        Message::new(
            "alice",
            ContentType::Text,
            Payload::Text("hi".into()),
            RoutingInfo {
                addressing_mode: AddressingMode::Direct,
                target: "bob".into(),
                priority: Default::default(),
                ttl_seconds: None,
            },
            DeliveryOptions::default(),
            Default::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn queue_then_get_queued_newest_first() {
        let h = handler();
        let m1 = msg();
        h.queue_for_offline(&m1, "bob", "inbox", None).await.unwrap();
        let queued = h.get_queued("bob", 10, 0, None).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message.id, m1.id);
    }

    #[tokio::test]
    async fn mark_delivered_updates_status() {
        let h = handler();
        let m1 = msg();
        h.queue_for_offline(&m1, "bob", "inbox", None).await.unwrap();
        h.mark_delivered(&m1.id.to_string(), "bob").await.unwrap();
        let queued = h.get_queued("bob", 10, 0, None).await.unwrap();
        assert_eq!(queued[0].status, OfflineStatus::Delivered);
    }

    #[tokio::test]
    async fn remove_delivered_drops_from_queue() {
        let h = handler();
        let m1 = msg();
        h.queue_for_offline(&m1, "bob", "inbox", None).await.unwrap();
        h.remove_delivered("bob", &[m1.id.to_string()]).await.unwrap();
        let queued = h.get_queued("bob", 10, 0, None).await.unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn mark_read_populates_indices() {
        let h = handler();
        let m1 = msg();
        h.mark_read("inbox", &m1.id.to_string(), "bob").await.unwrap();
        let index = h.kv.smembers(&agent_read_index_key("bob")).await.unwrap();
        assert_eq!(index, vec![m1.id.to_string()]);
    }
}
