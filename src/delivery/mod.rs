//! Real-Time Delivery (§4.I).

pub mod pattern;
pub mod realtime;

pub use realtime::{BroadcastOutcome, RealtimeDelivery, RealtimeDeliveryConfig};
