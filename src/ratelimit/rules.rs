//! Rate limit rules and per-route limiting options.
//!
//! A rule pairs a fixed counting window (`period`) with an independent ban
//! duration (`period_timespan`) that starts once the limit is reached.
//! Options wrap a rule with everything the gate needs to answer a request:
//! which header identifies the client, how to reject, and what to report.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::TimeDelta;
use thiserror::Error;

/// Quota message used when a route does not configure one.
///
/// `{0}` is replaced with the limit and `{1}` with the period.
pub const DEFAULT_QUOTA_MESSAGE: &str = "API calls quota exceeded! maximum admitted {0} per {1}.";
/// Header consulted for the client id when a route names none.
pub const DEFAULT_CLIENT_ID_HEADER: &str = "ClientId";
/// Client id assigned to requests that carry no id header at all.
pub const ANONYMOUS_CLIENT_ID: &str = "client";
/// Status returned for requests over quota.
pub const DEFAULT_STATUS_CODE: u16 = 429;
/// Prefix mixed into every storage key.
pub const DEFAULT_COUNTER_PREFIX: &str = "turnstile";
/// Period used when neither the route nor the global section sets one.
pub const DEFAULT_PERIOD: &str = "1s";

/// Longest accepted counting window or ban: ten years, in milliseconds.
const MAX_SPAN_MS: f64 = 10.0 * 365.0 * 86_400_000.0;

/// Errors raised while parsing a rule's period or ban duration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("period is empty")]
    Empty,
    #[error("period '{0}' does not start with a non-negative number")]
    InvalidValue(String),
    #[error("period '{period}' has unknown unit '{unit}', expected one of ms, s, m, h, d")]
    UnknownUnit { period: String, unit: String },
    #[error("period '{0}' is out of range")]
    OutOfRange(String),
    #[error("period '{0}' is shorter than one millisecond")]
    Zero(String),
    #[error("ban period '{0}' must be a finite, non-negative number of seconds")]
    InvalidTimespan(String),
}

/// Unit suffix of a period string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl PeriodUnit {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "ms" => Some(PeriodUnit::Millisecond),
            "s" => Some(PeriodUnit::Second),
            "m" => Some(PeriodUnit::Minute),
            "h" => Some(PeriodUnit::Hour),
            "d" => Some(PeriodUnit::Day),
            _ => None,
        }
    }

    /// Length of one unit in milliseconds.
    pub fn millis(&self) -> f64 {
        match self {
            PeriodUnit::Millisecond => 1.0,
            PeriodUnit::Second => 1_000.0,
            PeriodUnit::Minute => 60_000.0,
            PeriodUnit::Hour => 3_600_000.0,
            PeriodUnit::Day => 86_400_000.0,
        }
    }
}

/// Parse a period such as `1s`, `5m`, `1.5h`, `1d` or `500ms`.
///
/// Unknown suffixes are rejected instead of falling back to a default.
pub fn parse_period(period: &str) -> Result<TimeDelta, PeriodError> {
    let trimmed = period.trim();
    if trimmed.is_empty() {
        return Err(PeriodError::Empty);
    }

    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| PeriodError::UnknownUnit {
            period: period.to_string(),
            unit: String::new(),
        })?;
    let (value, suffix) = trimmed.split_at(split);

    let unit = PeriodUnit::from_suffix(suffix).ok_or_else(|| PeriodError::UnknownUnit {
        period: period.to_string(),
        unit: suffix.to_string(),
    })?;

    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| PeriodError::InvalidValue(period.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(PeriodError::InvalidValue(period.to_string()));
    }

    let millis = value * unit.millis();
    if millis > MAX_SPAN_MS {
        return Err(PeriodError::OutOfRange(period.to_string()));
    }
    let millis = millis.round() as i64;
    if millis < 1 {
        return Err(PeriodError::Zero(period.to_string()));
    }

    Ok(TimeDelta::milliseconds(millis))
}

fn seconds_to_delta(seconds: f64) -> TimeDelta {
    TimeDelta::milliseconds((seconds * 1_000.0).round() as i64)
}

/// A quota definition: `limit` requests per `period`, then a ban of
/// `period_timespan` seconds once the limit is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRule {
    period: String,
    window: TimeDelta,
    period_timespan: f64,
    limit: u64,
    client_whitelist: HashSet<String>,
}

impl RateLimitRule {
    /// Build a rule, validating the period string and the ban duration.
    pub fn new(period: &str, period_timespan: f64, limit: u64) -> Result<Self, PeriodError> {
        let window = parse_period(period)?;
        if !period_timespan.is_finite()
            || period_timespan < 0.0
            || period_timespan * 1_000.0 > MAX_SPAN_MS
        {
            return Err(PeriodError::InvalidTimespan(period_timespan.to_string()));
        }

        Ok(Self {
            period: period.trim().to_string(),
            window,
            period_timespan,
            limit,
            client_whitelist: HashSet::new(),
        })
    }

    /// Attach the clients that bypass this rule.
    pub fn with_whitelist<I, S>(mut self, clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_whitelist = clients.into_iter().map(Into::into).collect();
        self
    }

    /// The period as configured, e.g. `1s`.
    pub fn period(&self) -> &str {
        &self.period
    }

    /// The counting window.
    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// The counting window as a storage TTL.
    pub fn window_duration(&self) -> Duration {
        self.window.to_std().unwrap_or(Duration::ZERO)
    }

    /// The ban duration in seconds, exactly as configured.
    pub fn period_timespan(&self) -> f64 {
        self.period_timespan
    }

    /// The configured ban duration.
    pub fn ban_window(&self) -> TimeDelta {
        seconds_to_delta(self.period_timespan)
    }

    /// The ban duration clamped to at least one second.
    pub fn effective_period_timespan(&self) -> f64 {
        self.period_timespan.max(1.0)
    }

    /// The clamped ban duration.
    pub fn effective_ban_window(&self) -> TimeDelta {
        seconds_to_delta(self.effective_period_timespan())
    }

    /// The clamped ban duration as a storage TTL.
    pub fn effective_ban_duration(&self) -> Duration {
        Duration::from_secs_f64(self.effective_period_timespan())
    }

    /// Requests admitted per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Clients that bypass this rule.
    pub fn client_whitelist(&self) -> &HashSet<String> {
        &self.client_whitelist
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD.to_string(),
            window: TimeDelta::seconds(1),
            period_timespan: 0.0,
            limit: 0,
            client_whitelist: HashSet::new(),
        }
    }
}

/// Compact form used in logs and diagnostics: `limit/period/wBANs`.
impl fmt::Display for RateLimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/w{}s", self.limit, self.period, self.period_timespan)
    }
}

/// Rate limiting options of a single route, already merged with the global
/// configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitOptions {
    /// Whether limiting applies at all
    pub enabled: bool,
    /// Header carrying the client id; when set, requests without it are rejected
    pub client_id_header: Option<String>,
    /// The quota
    pub rule: RateLimitRule,
    /// Status returned for requests over quota
    pub status_code: u16,
    /// Message template for requests over quota
    pub quota_message: String,
    /// Whether `X-RateLimit-*` and `Retry-After` headers are emitted
    pub enable_headers: bool,
    /// Prefix mixed into storage keys
    pub counter_key_prefix: String,
}

impl RateLimitOptions {
    /// Enabled options for `rule` with every other setting at its default.
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            enabled: true,
            client_id_header: None,
            rule,
            status_code: DEFAULT_STATUS_CODE,
            quota_message: DEFAULT_QUOTA_MESSAGE.to_string(),
            enable_headers: true,
            counter_key_prefix: DEFAULT_COUNTER_PREFIX.to_string(),
        }
    }

    /// Options that switch limiting off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(RateLimitRule::default())
        }
    }

    /// Header name used to read the client id.
    pub fn client_id_header_name(&self) -> &str {
        self.client_id_header
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_CLIENT_ID_HEADER)
    }

    /// Whether the client id header must be present on every request.
    pub fn requires_client_id(&self) -> bool {
        self.client_id_header
            .as_deref()
            .is_some_and(|h| !h.is_empty())
    }

    /// The quota message with `{0}` and `{1}` substituted.
    pub fn quota_exceeded_message(&self) -> String {
        let template = if self.quota_message.is_empty() {
            DEFAULT_QUOTA_MESSAGE
        } else {
            self.quota_message.as_str()
        };

        template
            .replace("{0}", &self.rule.limit().to_string())
            .replace("{1}", self.rule.period())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_units() {
        assert_eq!(parse_period("1s").unwrap(), TimeDelta::seconds(1));
        assert_eq!(parse_period("2m").unwrap(), TimeDelta::minutes(2));
        assert_eq!(parse_period("3h").unwrap(), TimeDelta::hours(3));
        assert_eq!(parse_period("4d").unwrap(), TimeDelta::days(4));
        assert_eq!(parse_period("250ms").unwrap(), TimeDelta::milliseconds(250));
        assert_eq!(parse_period("1.5s").unwrap(), TimeDelta::milliseconds(1500));
    }

    #[test]
    fn test_parse_period_rejects_unknown_unit() {
        let err = parse_period("1a").unwrap_err();
        assert_eq!(
            err,
            PeriodError::UnknownUnit {
                period: "1a".to_string(),
                unit: "a".to_string()
            }
        );
        assert!(matches!(parse_period("2unknown"), Err(PeriodError::UnknownUnit { .. })));
        assert!(matches!(parse_period("10"), Err(PeriodError::UnknownUnit { .. })));
    }

    #[test]
    fn test_parse_period_rejects_bad_values() {
        assert_eq!(parse_period(""), Err(PeriodError::Empty));
        assert_eq!(parse_period("   "), Err(PeriodError::Empty));
        assert!(matches!(parse_period("s"), Err(PeriodError::InvalidValue(_))));
        assert!(matches!(parse_period("-1s"), Err(PeriodError::InvalidValue(_))));
        assert!(matches!(parse_period("99999d"), Err(PeriodError::OutOfRange(_))));
        assert!(matches!(parse_period("0s"), Err(PeriodError::Zero(_))));
        assert!(matches!(parse_period("0ms"), Err(PeriodError::Zero(_))));
        assert!(matches!(parse_period("0.0001s"), Err(PeriodError::Zero(_))));
        assert_eq!(parse_period("1ms").unwrap(), TimeDelta::milliseconds(1));
    }

    #[test]
    fn test_rule_rejects_zero_window() {
        assert!(matches!(
            RateLimitRule::new("0s", 1.0, 1),
            Err(PeriodError::Zero(_))
        ));
    }

    #[test]
    fn test_rule_rejects_invalid_timespan() {
        assert!(matches!(
            RateLimitRule::new("1s", -1.0, 3),
            Err(PeriodError::InvalidTimespan(_))
        ));
        assert!(matches!(
            RateLimitRule::new("1s", f64::NAN, 3),
            Err(PeriodError::InvalidTimespan(_))
        ));
    }

    #[test]
    fn test_rule_compact_form() {
        let rule = RateLimitRule::new("1s", 1.0, 3).unwrap();
        assert_eq!(rule.to_string(), "3/1s/w1s");

        let rule = RateLimitRule::new("1m", 2.5, 100).unwrap();
        assert_eq!(rule.to_string(), "100/1m/w2.5s");
    }

    #[test]
    fn test_effective_timespan_is_clamped() {
        let rule = RateLimitRule::new("1s", 0.0, 3).unwrap();
        assert_eq!(rule.period_timespan(), 0.0);
        assert_eq!(rule.effective_period_timespan(), 1.0);
        assert_eq!(rule.ban_window(), TimeDelta::zero());
        assert_eq!(rule.effective_ban_window(), TimeDelta::seconds(1));
        assert_eq!(rule.effective_ban_duration(), Duration::from_secs(1));

        let rule = RateLimitRule::new("1s", 3.0, 3).unwrap();
        assert_eq!(rule.effective_ban_window(), TimeDelta::seconds(3));
    }

    #[test]
    fn test_quota_message_substitution() {
        let rule = RateLimitRule::new("1m", 1.0, 5).unwrap();
        let mut options = RateLimitOptions::new(rule);
        assert_eq!(
            options.quota_exceeded_message(),
            "API calls quota exceeded! maximum admitted 5 per 1m."
        );

        options.quota_message = "Slow down: {0} calls every {1}".to_string();
        assert_eq!(options.quota_exceeded_message(), "Slow down: 5 calls every 1m");

        options.quota_message = String::new();
        assert!(options.quota_exceeded_message().starts_with("API calls quota exceeded!"));
    }

    #[test]
    fn test_client_id_header_name() {
        let mut options = RateLimitOptions::new(RateLimitRule::default());
        assert_eq!(options.client_id_header_name(), DEFAULT_CLIENT_ID_HEADER);
        assert!(!options.requires_client_id());

        options.client_id_header = Some(String::new());
        assert_eq!(options.client_id_header_name(), DEFAULT_CLIENT_ID_HEADER);
        assert!(!options.requires_client_id());

        options.client_id_header = Some("X-Api-Client".to_string());
        assert_eq!(options.client_id_header_name(), "X-Api-Client");
        assert!(options.requires_client_id());
    }

    #[test]
    fn test_disabled_options() {
        let options = RateLimitOptions::disabled();
        assert!(!options.enabled);
        assert_eq!(options.rule.limit(), 0);
    }
}
