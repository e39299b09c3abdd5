pub mod config;
pub mod error;
pub mod lock;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use config::LockConfig;
pub use error::LockError;
pub use lock::{DistributedLock, LockState};
pub use memory::InMemoryLockStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;
pub use store::LockStore;

#[cfg(feature = "mock")]
pub use store::MockLockStore;
