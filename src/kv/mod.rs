//! Component A — the KV Adapter seam and its two implementations.

pub mod backend;
pub mod error;
pub mod glob;
pub mod memory;
pub mod redis;

pub use backend::{KvAdapter, KvMessage, KvSubscription};
pub use error::KvError;
pub use memory::MemoryKv;
pub use redis::RedisKv;
