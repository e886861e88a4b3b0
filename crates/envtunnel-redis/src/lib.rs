//! Redis integration for the tunnel manager
//!
//! Provides the networked lock store shared by every process and a probe
//! that checks a tunnelled Redis service with a `PING`.

pub mod probe;
pub mod store;

pub use probe::RedisPingProbe;
pub use store::RedisLockStore;
