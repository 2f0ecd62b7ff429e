//! Core rate limiter implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::backend::{CounterStore, StorageError};
use super::counter::{count, retry_after, RateLimitCounter};
use super::identity::ClientRequestIdentity;
use super::rules::{RateLimitOptions, RateLimitRule};

/// Default number of lock shards guarding read-modify-write cycles.
pub const DEFAULT_LOCK_SHARDS: usize = 64;
/// Default upper bound for a single storage call.
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_millis(250);

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmitResult {
    /// The counter as written back to storage
    pub counter: RateLimitCounter,
    /// Whether the request is over quota
    pub blocked: bool,
}

/// Quota state reported to admitted clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Requests admitted per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset: DateTime<Utc>,
}

impl RateLimitHeaders {
    /// Quota state described by `counter`.
    pub fn for_counter(counter: &RateLimitCounter, rule: &RateLimitRule) -> Self {
        Self {
            limit: rule.limit(),
            remaining: rule.limit().saturating_sub(counter.total),
            reset: counter.started_at + rule.window(),
        }
    }

    /// `reset` as an ISO-8601 UTC timestamp.
    pub fn reset_header(&self) -> String {
        self.reset.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// The rate limiter: derives keys, counts requests and reports quota state.
///
/// Read-modify-write cycles are serialized per storage key through a fixed
/// table of async mutexes owned by the instance, so two requests for the
/// same key never count from the same previous state. Every storage call is
/// bounded by a timeout, and a failed read is treated as "no counter yet".
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    locks: Box<[Mutex<()>]>,
    storage_timeout: Duration,
}

impl RateLimiter {
    /// Create a rate limiter over `store` with default settings.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_settings(store, DEFAULT_LOCK_SHARDS, DEFAULT_STORAGE_TIMEOUT)
    }

    /// Create a rate limiter with an explicit lock shard count and storage timeout.
    pub fn with_settings(
        store: Arc<dyn CounterStore>,
        lock_shards: usize,
        storage_timeout: Duration,
    ) -> Self {
        let locks = (0..lock_shards.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            store,
            locks,
            storage_timeout,
        }
    }

    /// Count one request from `identity` and decide whether it is over quota.
    ///
    /// When the request is over quota but the ban has already run out, the
    /// stale counter is dropped and a fresh window is started with this
    /// request as its first.
    pub async fn admit(
        &self,
        identity: &ClientRequestIdentity,
        options: &RateLimitOptions,
        now: DateTime<Utc>,
    ) -> AdmitResult {
        let rule = &options.rule;
        let key = identity.storage_key(options);

        let _guard = self.lock_for(&key).lock().await;

        let previous = self.read(&key).await;
        let mut counter = count(previous.as_ref(), rule, now);
        let mut ttl = rule.window_duration();

        if counter.total > rule.limit() {
            if retry_after(&counter, rule, now) > 0.0 {
                // The ban has to outlive the nominal window.
                ttl = rule.effective_ban_duration();
            } else {
                debug!(
                    key = %key,
                    identity = %identity,
                    "Ban period elapsed, starting a new counting period"
                );
                self.delete(&key).await;
                counter = RateLimitCounter::start(now);
            }
        }

        self.write(&key, counter, ttl).await;

        let blocked = counter.total > rule.limit();
        trace!(
            key = %key,
            identity = %identity,
            total = counter.total,
            limit = rule.limit(),
            blocked,
            "Counted request"
        );

        AdmitResult { counter, blocked }
    }

    /// Report the quota state for `identity` without counting a request.
    ///
    /// Without a stored counter the headers describe a window starting now.
    pub async fn headers(
        &self,
        identity: &ClientRequestIdentity,
        options: &RateLimitOptions,
        now: DateTime<Utc>,
    ) -> RateLimitHeaders {
        let rule = &options.rule;
        let key = identity.storage_key(options);

        match self.read(&key).await {
            Some(counter) => RateLimitHeaders::for_counter(&counter, rule),
            None => RateLimitHeaders {
                limit: rule.limit(),
                remaining: rule.limit(),
                reset: now + rule.window(),
            },
        }
    }

    /// Whether `identity` bypasses limiting under `options`.
    pub fn is_whitelisted(&self, identity: &ClientRequestIdentity, options: &RateLimitOptions) -> bool {
        options.rule.client_whitelist().contains(&identity.client_id)
    }

    fn lock_for(&self, key: &str) -> &Mutex<()> {
        let hash = key
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        &self.locks[hash % self.locks.len()]
    }

    async fn guarded<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        tokio::time::timeout(self.storage_timeout, op)
            .await
            .map_err(|_| StorageError::Timeout(self.storage_timeout))?
    }

    async fn read(&self, key: &str) -> Option<RateLimitCounter> {
        match self.guarded(self.store.get(key)).await {
            Ok(counter) => counter,
            Err(e) => {
                warn!(key = %key, error = %e, "Counter read failed, treating as a fresh window");
                None
            }
        }
    }

    async fn write(&self, key: &str, counter: RateLimitCounter, ttl: Duration) {
        if let Err(e) = self.guarded(self.store.set(key, counter, ttl)).await {
            warn!(key = %key, error = %e, "Counter write failed");
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.guarded(self.store.remove(key)).await {
            warn!(key = %key, error = %e, "Counter removal failed");
        }
    }
}
