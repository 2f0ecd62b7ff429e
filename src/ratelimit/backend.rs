//! Counter storage trait for abstracting local and distributed backends.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::counter::RateLimitCounter;

/// Errors raised by counter storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("stored counter could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key/value storage for rate limit counters with TTL-based expiry.
///
/// Implementations only need per-call atomicity; the `RateLimiter` serializes
/// read-modify-write sequences for a key itself. Nothing here is assumed to
/// be linearizable across processes.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the counter stored under `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<RateLimitCounter>, StorageError>;

    /// Upsert the counter under `key`, keeping it for at least `ttl`.
    async fn set(&self, key: &str, counter: RateLimitCounter, ttl: Duration)
        -> Result<(), StorageError>;

    /// Delete the counter under `key`.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Whether a live counter exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}
