//! Rate limit counter and the pure accounting functions around it.
//!
//! A counter is an immutable value: [`count`] takes the previous state and
//! returns the next one, [`retry_after`] derives the wait time from a state.
//! Both take `now` as an argument so a single decision sees a single clock
//! reading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::RateLimitRule;

/// Persisted state of one client's quota for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    /// When the current counting period started
    pub started_at: DateTime<Utc>,
    /// When the limit was first reached in this period
    pub exceeded_at: Option<DateTime<Utc>>,
    /// Requests counted in this period
    pub total: u64,
}

impl RateLimitCounter {
    /// A counter for the first request of a fresh window.
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            exceeded_at: None,
            total: 1,
        }
    }

    /// Whether the counting window that began at `started_at` still covers `now`.
    pub fn in_window(&self, rule: &RateLimitRule, now: DateTime<Utc>) -> bool {
        self.started_at + rule.window() >= now
    }
}

/// Advance `previous` by one request at `now`.
pub fn count(
    previous: Option<&RateLimitCounter>,
    rule: &RateLimitRule,
    now: DateTime<Utc>,
) -> RateLimitCounter {
    let Some(previous) = previous else {
        return RateLimitCounter::start(now);
    };

    if previous.in_window(rule, now) {
        let total = previous.total + 1;
        let exceeded_at = match previous.exceeded_at {
            None if total >= rule.limit() => Some(now),
            kept => kept,
        };
        return RateLimitCounter {
            started_at: previous.started_at,
            exceeded_at,
            total,
        };
    }

    // Waiting out the nominal window does not lift an active ban.
    if let Some(exceeded_at) = previous.exceeded_at {
        if exceeded_at + rule.ban_window() >= now {
            return RateLimitCounter {
                started_at: previous.started_at,
                exceeded_at: Some(exceeded_at),
                total: previous.total + 1,
            };
        }
    }

    RateLimitCounter::start(now)
}

/// Seconds the client should wait before retrying.
///
/// `counter` must be the value returned by [`count`] for the current request;
/// passing the state read from storage before counting gives stale answers.
/// Zero or a negative value means the request may proceed.
pub fn retry_after(counter: &RateLimitCounter, rule: &RateLimitRule, now: DateTime<Utc>) -> f64 {
    let span = rule.effective_period_timespan();

    if counter.in_window(rule, now) {
        if counter.total < rule.limit() {
            return 0.0;
        }
        return match counter.exceeded_at {
            Some(exceeded_at) => span - seconds_between(exceeded_at, now),
            None => span,
        };
    }

    match counter.exceeded_at {
        Some(exceeded_at) if exceeded_at + rule.effective_ban_window() >= now => {
            span - seconds_between(exceeded_at, now)
        }
        _ => 0.0,
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1_000.0
}
