//! Resilience Manager (§4.B–D): combines a per-operation circuit breaker
//! pool with the local fallback queue, and runs the background loops that
//! keep both honest — a health monitor that rolls breaker state into one
//! service-wide signal, and a queue processor that retries parked
//! operations once their breaker recovers.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::component::{Component, ComponentStatus};
use crate::error::MailboxError;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitCallError, CircuitState};
use super::fallback_queue::{FallbackQueue, FallbackQueueConfig, QueuedOperation};

pub const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(30);
pub const QUEUE_PROCESSOR_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Healthy = 0,
    Degraded = 1,
    Unavailable = 2,
}

impl From<u8> for ServiceState {
    fn from(v: u8) -> Self {
        match v {
            0 => ServiceState::Healthy,
            1 => ServiceState::Degraded,
            _ => ServiceState::Unavailable,
        }
    }
}

type Replayer = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<(), MailboxError>> + Send + Sync>;

pub struct ResilienceManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
    queue: Arc<FallbackQueue>,
    replayers: DashMap<String, Replayer>,
    state: AtomicU8,
}

impl ResilienceManager {
    pub fn new(breaker_config: CircuitBreakerConfig, queue_config: FallbackQueueConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            breaker_config,
            queue: Arc::new(FallbackQueue::new(queue_config)),
            replayers: DashMap::new(),
            state: AtomicU8::new(ServiceState::Healthy as u8),
        }
    }

    pub fn queue(&self) -> Arc<FallbackQueue> {
        Arc::clone(&self.queue)
    }

    fn breaker_for(&self, operation: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.breaker_config.clone())))
            .clone()
    }

    /// Registers the function used to replay a queued operation once its
    /// breaker recovers. `operation` must match the name passed to
    /// [`Self::execute_or_queue`].
    pub fn register_replayer<F, Fut>(&self, operation: impl Into<String>, replay: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MailboxError>> + Send + 'static,
    {
        self.replayers
            .insert(operation.into(), Arc::new(move |payload| Box::pin(replay(payload))));
    }

    /// Runs `primary` through the named circuit breaker. No fallback queue
    /// involvement: for read paths and anything without a sensible replay.
    pub async fn execute<F, Fut, T>(&self, operation: &str, primary: F) -> Result<T, MailboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MailboxError>>,
    {
        let breaker = self.breaker_for(operation);
        match breaker.call(primary).await {
            Ok(value) => Ok(value),
            Err(CircuitCallError::Open(e)) => Err(MailboxError::BackendUnavailable(e.to_string())),
            Err(CircuitCallError::Timeout) => {
                Err(MailboxError::BackendUnavailable(format!("{operation} timed out")))
            }
            Err(CircuitCallError::Inner(e)) => Err(e),
        }
    }

    /// Runs `primary` through the named breaker; on failure, parks `payload`
    /// in the fallback queue for later replay instead of propagating a hard
    /// error to the caller's caller.
    pub async fn execute_or_queue<F, Fut>(
        &self,
        operation: &str,
        payload: serde_json::Value,
        primary: F,
    ) -> Result<(), MailboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), MailboxError>>,
    {
        match self.execute(operation, primary).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(operation, error = %e, "parking operation in fallback queue");
                self.queue.enqueue(QueuedOperation::new(operation, payload));
                Err(e)
            }
        }
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from(self.state.load(Ordering::Relaxed))
    }

    pub fn breaker_stats(&self) -> Vec<(String, CircuitBreakerStats)> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().stats()))
            .collect()
    }

    fn recompute_state(&self) {
        let total = self.breakers.len();
        if total == 0 {
            self.state.store(ServiceState::Healthy as u8, Ordering::Relaxed);
            return;
        }
        let open = self
            .breakers
            .iter()
            .filter(|e| e.value().state() == CircuitState::Open)
            .count();
        let next = if open == 0 {
            ServiceState::Healthy
        } else if open * 2 < total {
            ServiceState::Degraded
        } else {
            ServiceState::Unavailable
        };
        self.state.store(next as u8, Ordering::Relaxed);
    }

    async fn process_queue_once(&self) {
        for op in self.queue.drain_pending() {
            let Some(replayer) = self.replayers.get(&op.operation_name).map(|r| r.clone()) else {
                debug!(operation = %op.operation_name, "no replayer registered, dropping");
                continue;
            };
            match replayer(op.payload.clone()).await {
                Ok(()) => debug!(operation = %op.operation_name, id = %op.id, "replayed fallback entry"),
                Err(e) => {
                    warn!(operation = %op.operation_name, id = %op.id, error = %e, "replay failed, requeueing");
                    self.queue.requeue(op);
                }
            }
        }
    }

    /// Spawns the health-monitor and queue-processor background loops.
    /// Callers keep the returned handles to abort them on shutdown.
    pub fn spawn_background_loops(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let health = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEALTH_MONITOR_INTERVAL);
                loop {
                    ticker.tick().await;
                    manager.recompute_state();
                }
            })
        };
        let queue_processor = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(QUEUE_PROCESSOR_INTERVAL);
                loop {
                    ticker.tick().await;
                    manager.process_queue_once().await;
                }
            })
        };
        (health, queue_processor)
    }
}

impl Component for ResilienceManager {
    fn status(&self) -> ComponentStatus {
        match self.state() {
            ServiceState::Healthy => ComponentStatus::Healthy,
            ServiceState::Degraded => ComponentStatus::Degraded,
            ServiceState::Unavailable => ComponentStatus::Unavailable,
        }
    }

    fn health_indicators(&self) -> Vec<(&'static str, String)> {
        vec![
            ("state", format!("{:?}", self.state())),
            ("open_breakers", self.breakers.iter().filter(|e| e.value().state() == CircuitState::Open).count().to_string()),
            ("fallback_queue_len", self.queue.len().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn execute_or_queue_parks_payload_on_failure() {
        let manager = ResilienceManager::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            FallbackQueueConfig::default(),
        );
        let result = manager
            .execute_or_queue("publish", serde_json::json!({"k": "v"}), || async {
                Err(MailboxError::BackendUnavailable("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.queue().len(), 1);
    }

    #[tokio::test]
    async fn process_queue_replays_with_registered_callback() {
        let manager = Arc::new(ResilienceManager::new(
            CircuitBreakerConfig::default(),
            FallbackQueueConfig::default(),
        ));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        manager.register_replayer("publish", move |_payload| {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        manager.queue().enqueue(QueuedOperation::new("publish", serde_json::json!({})));
        manager.process_queue_once().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.queue().is_empty());
    }
}
