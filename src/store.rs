//! Key-value primitives the durable queue is built on.
//!
//! Implementations must make the batch operations atomic: either every write
//! in the batch lands or none does.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Push `payload` onto the head of `list` and set `key = value` with `ttl`,
    /// as one atomic batch.
    async fn push_with_value(
        &self,
        list: &str,
        payload: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()>;

    /// Pop from the tail of `list`, waiting up to `timeout` (zero waits forever).
    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>>;

    /// Set every pair with `ttl`, as one atomic batch.
    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn list_len(&self, list: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}
