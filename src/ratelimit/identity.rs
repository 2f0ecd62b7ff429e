//! Client identity and storage key derivation.

use sha1::{Digest, Sha1};

use super::rules::RateLimitOptions;

/// The subject being throttled: one client calling one path with one verb.
///
/// The path is lower-cased and the verb upper-cased so that
/// `GET /Api/Users` and `get /api/users` share a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientRequestIdentity {
    /// Value of the client id header
    pub client_id: String,
    /// Request path, lower-cased
    pub path: String,
    /// HTTP method, upper-cased
    pub verb: String,
}

impl ClientRequestIdentity {
    /// Create a new identity, normalizing path and verb.
    pub fn new(client_id: impl Into<String>, path: &str, verb: &str) -> Self {
        Self {
            client_id: client_id.into(),
            path: path.to_lowercase(),
            verb: verb.to_uppercase(),
        }
    }

    /// The unhashed composite key: `prefix_clientId_period_verb_path`.
    pub fn to_string_key(&self, options: &RateLimitOptions) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            options.counter_key_prefix,
            self.client_id,
            options.rule.period(),
            self.verb,
            self.path
        )
    }

    /// The storage key for this identity under `options`.
    ///
    /// A SHA-1 digest of the composite key rendered as 40 uppercase hex
    /// characters, so keys have a fixed length and never expose raw client
    /// ids or paths to the storage backend.
    pub fn storage_key(&self, options: &RateLimitOptions) -> String {
        let digest = Sha1::digest(self.to_string_key(options).as_bytes());
        hex::encode_upper(digest)
    }
}

impl std::fmt::Display for ClientRequestIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.verb, self.path, self.client_id)
    }
}
