//! Typed records for the message plane's data model (§3).
//!
//! Dynamic dictionaries of heterogeneous values in the reference
//! implementations become tagged records here, with explicit sum types for
//! every enumeration, per the re-architecture guidance in §9.

pub mod confirmation;
pub mod ids;
pub mod mailbox;
pub mod message;
pub mod offline;
pub mod subscription;
pub mod topic;

pub use confirmation::{DeliveryAttempt, DeliveryConfirmation, DeliveryStatus, RoutingResult};
pub use ids::{MessageId, SubscriptionId, TopicId, validate_agent_id, validate_target};
pub use mailbox::{MailboxMetadata, MailboxState, MessageFilter};
pub use message::{
    AddressingMode, ContentType, DeliveryOptions, Message, Metadata, Payload, Priority,
    RetryPolicy, RoutingInfo,
};
pub use offline::{OfflineMessage, OfflineStatus, ReadStatus};
pub use subscription::{ConnectionState, DeliveryMode, Subscription, SubscriptionOptions};
pub use topic::{Topic, TopicConfig, TopicStatistics};
