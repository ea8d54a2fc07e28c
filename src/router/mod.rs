//! Message Router (§4.J).

pub mod config;
pub mod router;

pub use config::RouterConfig;
pub use router::Router;
