//! Subscription Manager (§4.H).

pub mod manager;

pub use manager::{Handler, SubscriptionManager};
