//! Local fallback queue (§4.B–D): when the primary KV backend is
//! unavailable, operations that would otherwise fail are parked here and
//! drained once the circuit recovers. Bounded FIFO with optional disk
//! persistence across restarts.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
pub const DEFAULT_MAX_AGE_SECS: i64 = 24 * 3600;
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: uuid::Uuid,
    pub operation_name: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl QueuedOperation {
    pub fn new(operation_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            operation_name: operation_name.into(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.enqueued_at);
        age.num_milliseconds() as u64 > max_age.as_millis() as u64
    }
}

pub struct FallbackQueueConfig {
    pub max_queue_size: usize,
    pub max_age: Duration,
    pub max_retry_count: u32,
    pub persistence_path: Option<PathBuf>,
}

impl Default for FallbackQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS as u64),
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            persistence_path: None,
        }
    }
}

pub struct FallbackQueue {
    config: FallbackQueueConfig,
    queue: Mutex<VecDeque<QueuedOperation>>,
}

impl FallbackQueue {
    pub fn new(config: FallbackQueueConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueues an operation, dropping the oldest entry if the queue is
    /// already at capacity.
    pub fn enqueue(&self, op: QueuedOperation) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queue_size {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    operation = %dropped.operation_name,
                    id = %dropped.id,
                    "fallback queue full, dropping oldest entry"
                );
            }
        }
        queue.push_back(op);
    }

    /// Removes and returns expired or retry-exhausted entries, then hands
    /// back the remaining queue contents in FIFO order for draining.
    pub fn drain_pending(&self) -> Vec<QueuedOperation> {
        let mut queue = self.queue.lock();
        let (keep, drop): (VecDeque<_>, VecDeque<_>) = queue.drain(..).partition(|op| {
            !op.is_expired(self.config.max_age) && op.retry_count < self.config.max_retry_count
        });
        for dropped in &drop {
            warn!(
                operation = %dropped.operation_name,
                id = %dropped.id,
                retry_count = dropped.retry_count,
                "dropping fallback entry (expired or retries exhausted)"
            );
        }
        *queue = VecDeque::new();
        keep.into()
    }

    pub fn requeue(&self, mut op: QueuedOperation) {
        op.retry_count += 1;
        if op.retry_count >= self.config.max_retry_count || op.is_expired(self.config.max_age) {
            warn!(operation = %op.operation_name, id = %op.id, "dropping fallback entry after retries exhausted");
            return;
        }
        self.queue.lock().push_back(op);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn persist(&self) -> std::io::Result<()> {
        let Some(path) = &self.config.persistence_path else {
            return Ok(());
        };
        let snapshot: Vec<QueuedOperation> = self.queue.lock().iter().cloned().collect();
        let json = serde_json::to_vec(&snapshot).unwrap_or_default();
        tokio::fs::write(path, json).await
    }

    pub async fn load(&self) -> std::io::Result<()> {
        let Some(path) = &self.config.persistence_path else {
            return Ok(());
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        let bytes = tokio::fs::read(path).await?;
        let restored: Vec<QueuedOperation> = serde_json::from_slice(&bytes).unwrap_or_default();
        let mut queue = self.queue.lock();
        for op in restored {
            queue.push_back(op);
        }
        Ok(())
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.config.persistence_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let queue = FallbackQueue::new(FallbackQueueConfig {
            max_queue_size: 2,
            ..Default::default()
        });
        queue.enqueue(QueuedOperation::new("a", serde_json::json!({})));
        queue.enqueue(QueuedOperation::new("b", serde_json::json!({})));
        queue.enqueue(QueuedOperation::new("c", serde_json::json!({})));
        let drained = queue.drain_pending();
        let names: Vec<&str> = drained.iter().map(|o| o.operation_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn requeue_drops_after_max_retries() {
        let queue = FallbackQueue::new(FallbackQueueConfig {
            max_retry_count: 1,
            ..Default::default()
        });
        let op = QueuedOperation::new("a", serde_json::json!({}));
        queue.requeue(op);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn persists_and_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.json");
        let config = FallbackQueueConfig {
            persistence_path: Some(path.clone()),
            ..Default::default()
        };
        let queue = FallbackQueue::new(config);
        queue.enqueue(QueuedOperation::new("a", serde_json::json!({"x": 1})));
        queue.persist().await.unwrap();

        let config2 = FallbackQueueConfig {
            persistence_path: Some(path),
            ..Default::default()
        };
        let reloaded = FallbackQueue::new(config2);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
