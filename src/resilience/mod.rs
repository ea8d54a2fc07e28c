//! Resilience Layer — circuit breaking, local fallback queueing, and the
//! background loops that tie them together (§4.B–D).

pub mod circuit_breaker;
pub mod fallback_queue;
pub mod manager;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitOpenError, CircuitState};
pub use fallback_queue::{FallbackQueue, FallbackQueueConfig, QueuedOperation};
pub use manager::{ResilienceManager, ServiceState};
