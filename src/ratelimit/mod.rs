//! Rate limiting logic and counter storage.

mod backend;
mod counter;
mod distributed;
mod identity;
mod limiter;
mod memory;
mod rules;

pub use backend::{CounterStore, StorageError};
pub use counter::{count, retry_after, RateLimitCounter};
pub use distributed::ClusterCounterStore;
pub use identity::ClientRequestIdentity;
pub use limiter::{
    AdmitResult, RateLimitHeaders, RateLimiter, DEFAULT_LOCK_SHARDS, DEFAULT_STORAGE_TIMEOUT,
};
pub use memory::{MemoryCounterStore, DEFAULT_CAPACITY};
pub use rules::{
    parse_period, PeriodError, RateLimitOptions, RateLimitRule, ANONYMOUS_CLIENT_ID,
    DEFAULT_CLIENT_ID_HEADER, DEFAULT_COUNTER_PREFIX, DEFAULT_PERIOD, DEFAULT_QUOTA_MESSAGE,
    DEFAULT_STATUS_CODE,
};
