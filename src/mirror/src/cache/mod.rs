pub mod key;
pub mod storage;
pub mod sweeper;

pub use key::{ArtifactClass, CacheKey};
pub use storage::{CacheEntry, CacheStorage};
pub use sweeper::{CacheSweeper, SweepReport};
