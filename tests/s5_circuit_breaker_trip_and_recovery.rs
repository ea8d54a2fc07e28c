use std::sync::Arc;
use std::time::Duration;

use illm_mailbox::error::MailboxError;
use illm_mailbox::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackQueueConfig, QueuedOperation, ResilienceManager};

fn fast_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 5,
        recovery_timeout: Duration::from_millis(50),
        success_threshold: 3,
        call_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn five_consecutive_failures_trip_the_breaker_then_it_recovers() {
    let breaker = CircuitBreaker::new("kv.publish", fast_config());

    for _ in 0..5 {
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.call(|| async { Ok::<_, &str>(()) }).await;
    assert!(rejected.is_err(), "open breaker must short-circuit without running the call");

    tokio::time::sleep(Duration::from_millis(60)).await;

    for i in 0..3 {
        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        if i < 2 {
            assert_eq!(breaker.state(), CircuitState::HalfOpen);
        }
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn sends_during_an_open_breaker_park_in_the_fallback_queue_and_drain_once_healthy() {
    let manager = Arc::new(ResilienceManager::new(
        CircuitBreakerConfig {
            failure_threshold: 1,
            ..fast_config()
        },
        FallbackQueueConfig::default(),
    ));

    let result = manager
        .execute_or_queue("mailbox_store.store_message", serde_json::json!({"id": "m1"}), || async {
            Err(MailboxError::BackendUnavailable("kv down".into()))
        })
        .await;
    assert!(result.is_err());
    assert_eq!(manager.queue().len(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;

    let drained: Vec<QueuedOperation> = manager.queue().drain_pending();
    assert_eq!(drained.len(), 1);
    assert!(manager.queue().is_empty());

    let replayed = manager
        .execute("mailbox_store.store_message", || async { Ok::<(), MailboxError>(()) })
        .await;
    assert!(replayed.is_ok());
}
