//! Crate-level error kinds (§7).
//!
//! Leaf components raise their own `thiserror` enums (`KvError`,
//! `StorageError`, ...); this type is what the §6 facade functions return,
//! unifying the semantic kinds of §7 so callers can match on *meaning*
//! rather than on which component happened to raise it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailboxError {
    /// Message or subscription fails a structural rule. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Caller lacks permission for the operation. The core never makes this
    /// decision itself (the gateway's `check_permission` hook runs first);
    /// this variant exists so a gateway can surface a denial through the
    /// same error type the rest of the facade uses.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Mailbox/subscription/topic absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate create.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backing KV store failed under the circuit breaker or timed out.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A specific delivery attempt failed.
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),

    /// TTL exceeded at route time or during retry.
    #[error("message expired")]
    Expired,

    /// A subscriber handler raised while processing a realtime delivery.
    #[error("handler error: {0}")]
    Handler(String),

    /// `payload_hash` did not match on read; the message is corrupt.
    #[error("integrity error: {0}")]
    Integrity(String),
}

impl MailboxError {
    /// Whether this error kind is ever eligible for retry (§7: only
    /// `DeliveryFailed` and transient `BackendUnavailable` are).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MailboxError::DeliveryFailed(_) | MailboxError::BackendUnavailable(_)
        )
    }
}

impl From<crate::kv::KvError> for MailboxError {
    fn from(e: crate::kv::KvError) -> Self {
        MailboxError::BackendUnavailable(e.to_string())
    }
}

impl From<crate::resilience::circuit_breaker::CircuitOpenError> for MailboxError {
    fn from(e: crate::resilience::circuit_breaker::CircuitOpenError) -> Self {
        MailboxError::BackendUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MailboxError>;
