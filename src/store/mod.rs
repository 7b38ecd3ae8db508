//! Shared key-value store interface
//!
//! The link cache keeps its shared-mode state behind [`KvStore`]: hashes,
//! sets and integer counters addressed by string keys, with atomic single-key
//! operations only. [`MemoryStore`] is the in-process implementation used for
//! development and tests.

mod memory;

pub use memory::MemoryStore;

use crate::Result;
use async_trait::async_trait;

/// Key-value store with hash, set and counter values
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Round trip used to verify connectivity at construction time
    async fn ping(&self) -> Result<()>;

    /// Read one hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Every field of a hash sorted by field name, empty if the key is missing
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    /// Write one hash field. Returns `true` if the field was new.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Delete hash fields. Returns how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize>;

    /// Delete a key of any type. Returns `true` if it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically add `delta` to a counter, creating it at zero, and return
    /// the new value
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn get_counter(&self, key: &str) -> Result<Option<i64>>;

    /// Add a set member. Returns `true` if it was not already present.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a set member. Returns `true` if it was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// All members of a set, empty if the key is missing
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
}
