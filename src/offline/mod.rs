//! Offline Message Handler (§4.F).

pub mod handler;

pub use handler::OfflineHandler;
