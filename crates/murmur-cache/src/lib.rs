//! Typed operations over a networked key/value store.
//!
//! [`CacheStore`] exposes the five container kinds of a Redis-style server
//! (scalar, list, hash, set, ordered set) as plain byte-level operations.
//! Callers own the encoding of values; this crate only moves bytes.
//!
//! Two backends are provided: [`RedisStore`] for production, backed by a small
//! pool of connections, and [`MemoryStore`], an in-process implementation with
//! the same semantics for tests and single-node development.

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod transaction;

pub use error::{CacheError, CacheResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use transaction::{Command, Reply, Transaction};

/// Lowest possible score bound (`-inf`).
pub const MIN_SCORE: i64 = i64::MIN;
/// Highest possible score bound (`+inf`).
pub const MAX_SCORE: i64 = i64::MAX;

/// Traversal direction for ordered-set reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Lowest score first.
    #[default]
    Forward,
    /// Highest score first.
    Reverse,
}

/// Byte-level cache operations.
///
/// Every method is a single round trip to the backend. Absent keys behave like
/// empty containers, as in Redis: reads return `None`/empty/zero and writes
/// create the container. Issuing a command against a key that holds another
/// container kind fails with [`CacheError::ShapeMismatch`].
pub trait CacheStore: Send + Sync {
    // -- Keys --

    fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Remove a key of any kind. Returns whether it existed.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Drop every key in the selected database.
    fn flush_all(&self) -> CacheResult<()>;

    // -- Scalars --

    fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Overwrites any existing value.
    fn set(&self, key: &str, value: &[u8]) -> CacheResult<()>;

    /// Store only if the key does not exist yet. Returns whether it was stored.
    fn set_if_absent(&self, key: &str, value: &[u8]) -> CacheResult<bool>;

    /// Atomically add one to an integer scalar (absent counts as zero).
    fn increment(&self, key: &str) -> CacheResult<i64>;

    /// Atomically subtract one from an integer scalar (absent counts as zero).
    fn decrement(&self, key: &str) -> CacheResult<i64>;

    // -- Lists --

    /// Append to the tail. Returns the new length.
    fn push_back(&self, key: &str, value: &[u8]) -> CacheResult<i64>;

    /// Prepend to the head. Returns the new length.
    fn push_front(&self, key: &str, value: &[u8]) -> CacheResult<i64>;

    /// Inclusive index range; negative indices count from the tail.
    fn list_range(&self, key: &str, start: i64, end: i64) -> CacheResult<Vec<Vec<u8>>>;

    fn list_len(&self, key: &str) -> CacheResult<i64>;

    /// Remove the first element equal to `value`.
    fn remove_from_list(&self, key: &str, value: &[u8]) -> CacheResult<bool>;

    // -- Hashes --

    /// Returns whether the field is new.
    fn set_field(&self, key: &str, field: &str, value: &[u8]) -> CacheResult<bool>;

    fn get_field(&self, key: &str, field: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Values of the requested fields in request order; missing fields are skipped.
    fn get_fields(&self, key: &str, fields: &[&str]) -> CacheResult<Vec<Vec<u8>>>;

    fn all_values(&self, key: &str) -> CacheResult<Vec<Vec<u8>>>;

    fn field_count(&self, key: &str) -> CacheResult<i64>;

    fn field_keys(&self, key: &str) -> CacheResult<Vec<String>>;

    fn delete_field(&self, key: &str, field: &str) -> CacheResult<bool>;

    // -- Sets --

    /// Returns whether the member is new.
    fn add_member(&self, key: &str, member: &[u8]) -> CacheResult<bool>;

    fn members(&self, key: &str) -> CacheResult<Vec<Vec<u8>>>;

    fn remove_member(&self, key: &str, member: &[u8]) -> CacheResult<bool>;

    fn member_count(&self, key: &str) -> CacheResult<i64>;

    // -- Ordered sets --

    /// Insert or re-score a member. Returns whether the member is new.
    fn add_with_score(&self, key: &str, score: i64, member: &[u8]) -> CacheResult<bool>;

    /// Set the member's score only if it is higher than the current one (or the
    /// member is absent). Returns whether anything changed. This is the atomic
    /// max-merge primitive (`ZADD GT CH`).
    fn raise_score(&self, key: &str, score: i64, member: &[u8]) -> CacheResult<bool>;

    fn score(&self, key: &str, member: &[u8]) -> CacheResult<Option<i64>>;

    /// Members with `min <= score <= max`, walked in `direction`, then
    /// `offset` skipped and at most `limit` returned.
    fn range_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: Option<usize>,
        offset: usize,
        direction: Direction,
    ) -> CacheResult<Vec<Vec<u8>>>;

    /// Inclusive rank range in `direction`; negative ranks count from the end.
    fn range_by_rank(
        &self,
        key: &str,
        start: i64,
        end: i64,
        direction: Direction,
    ) -> CacheResult<Vec<Vec<u8>>>;

    /// Number of members with `min <= score <= max`.
    fn count_by_score(&self, key: &str, min: i64, max: i64) -> CacheResult<i64>;

    fn cardinality(&self, key: &str) -> CacheResult<i64>;

    fn remove_matching(&self, key: &str, member: &[u8]) -> CacheResult<bool>;

    // -- Transactions --

    /// Apply all queued commands as one atomic unit. Replies come back in queue order.
    fn commit(&self, tx: Transaction) -> CacheResult<Vec<Reply>>;
}
