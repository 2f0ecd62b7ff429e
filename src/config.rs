//! Configuration management for Turnstile.
//!
//! Configuration is read from a YAML file and environment variables
//! prefixed with `TURNSTILE__`, `__` separating nested keys
//! (`TURNSTILE__SERVER__HTTP_ADDR=0.0.0.0:9000`).

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::{HeaderName, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TurnstileError};
use crate::gate::{Route, RouteTable};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{
    RateLimitOptions, RateLimitRule, DEFAULT_CAPACITY, DEFAULT_COUNTER_PREFIX,
    DEFAULT_LOCK_SHARDS, DEFAULT_PERIOD, DEFAULT_QUOTA_MESSAGE, DEFAULT_STATUS_CODE,
};

/// Main configuration for the Turnstile gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rate limiting defaults shared by routes
    #[serde(default)]
    pub global_rate_limit_options: Option<FileRateLimitOptions>,

    /// Upstream routes in priority order
    #[serde(default)]
    pub routes: Vec<FileRoute>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared over the gossip mesh
    Cluster,
}

/// Counter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackend,

    /// Local cache size for rate limit counters
    #[serde(default = "default_cache_size")]
    pub local_cache_size: usize,

    /// Upper bound for one storage call in milliseconds
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_ms: u64,

    /// Number of lock shards serializing counter updates
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,

    /// Gossip settings for the cluster backend
    #[serde(default)]
    pub cluster: ClusterSettings,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            local_cache_size: default_cache_size(),
            storage_timeout_ms: default_storage_timeout(),
            lock_shards: default_lock_shards(),
            cluster: ClusterSettings::default(),
        }
    }
}

impl StorageConfig {
    /// The storage timeout as a duration.
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

fn default_cache_size() -> usize {
    DEFAULT_CAPACITY
}

fn default_storage_timeout() -> u64 {
    250
}

fn default_lock_shards() -> usize {
    DEFAULT_LOCK_SHARDS
}

/// Gossip mesh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Node id; a random one is generated when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes (`host:port`)
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with nodes of the same cluster id
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
        }
    }
}

impl ClusterSettings {
    /// Build the runtime cluster configuration.
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
            sweep_interval: defaults.sweep_interval,
        }
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "turnstile".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

/// Rate limiting options as written in configuration.
///
/// Every field is optional so that route options can fall back to the
/// global ones field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRateLimitOptions {
    #[serde(default)]
    pub enable_rate_limiting: Option<bool>,
    #[serde(default)]
    pub client_id_header: Option<String>,
    #[serde(default)]
    pub client_whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub enable_headers: Option<bool>,
    #[serde(default)]
    pub http_status_code: Option<u16>,
    #[serde(default)]
    pub quota_exceeded_message: Option<String>,
    #[serde(default)]
    pub rate_limit_counter_prefix: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    /// Ban duration in seconds
    #[serde(default)]
    pub period_timespan: Option<f64>,
    #[serde(default)]
    pub limit: Option<u64>,
    /// Global options only: keys of the routes they apply to; empty or unset
    /// applies them to every route
    #[serde(default)]
    pub route_keys: Option<Vec<String>>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

impl FileRateLimitOptions {
    /// Whether these global options cover the route with `route_key`.
    fn covers(&self, route_key: Option<&str>) -> bool {
        match &self.route_keys {
            None => true,
            Some(keys) if keys.is_empty() => true,
            Some(keys) => route_key.is_some_and(|key| keys.iter().any(|k| k == key)),
        }
    }

    /// Fill every unset field from `global`.
    fn merged_with(&self, global: &FileRateLimitOptions) -> FileRateLimitOptions {
        FileRateLimitOptions {
            enable_rate_limiting: self.enable_rate_limiting.or(global.enable_rate_limiting),
            client_id_header: non_empty(&self.client_id_header)
                .or_else(|| non_empty(&global.client_id_header)),
            client_whitelist: self
                .client_whitelist
                .clone()
                .or_else(|| global.client_whitelist.clone()),
            enable_headers: self.enable_headers.or(global.enable_headers),
            http_status_code: self.http_status_code.or(global.http_status_code),
            quota_exceeded_message: non_empty(&self.quota_exceeded_message)
                .or_else(|| non_empty(&global.quota_exceeded_message)),
            rate_limit_counter_prefix: non_empty(&self.rate_limit_counter_prefix)
                .or_else(|| non_empty(&global.rate_limit_counter_prefix)),
            period: non_empty(&self.period).or_else(|| non_empty(&global.period)),
            period_timespan: self.period_timespan.or(global.period_timespan),
            limit: self.limit.or(global.limit),
            route_keys: None,
        }
    }

    /// Build engine options, applying built-in defaults to unset fields.
    pub fn to_options(&self) -> Result<RateLimitOptions> {
        let period = non_empty(&self.period).unwrap_or_else(|| DEFAULT_PERIOD.to_string());
        let rule = RateLimitRule::new(
            &period,
            self.period_timespan.unwrap_or(0.0),
            self.limit.unwrap_or(0),
        )?
        .with_whitelist(self.client_whitelist.clone().unwrap_or_default());

        let status_code = self.http_status_code.unwrap_or(DEFAULT_STATUS_CODE);
        if StatusCode::from_u16(status_code).is_err() {
            return Err(TurnstileError::Config(format!(
                "invalid HTTP status code {}",
                status_code
            )));
        }

        let client_id_header = non_empty(&self.client_id_header).map(|h| h.trim().to_string());
        if let Some(header) = &client_id_header {
            if HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(TurnstileError::Config(format!(
                    "invalid client id header name '{}'",
                    header
                )));
            }
        }

        Ok(RateLimitOptions {
            enabled: self.enable_rate_limiting.unwrap_or(true),
            client_id_header,
            rule,
            status_code,
            quota_message: non_empty(&self.quota_exceeded_message)
                .unwrap_or_else(|| DEFAULT_QUOTA_MESSAGE.to_string()),
            enable_headers: self.enable_headers.unwrap_or(true),
            counter_key_prefix: non_empty(&self.rate_limit_counter_prefix)
                .unwrap_or_else(|| DEFAULT_COUNTER_PREFIX.to_string()),
        })
    }
}

/// An upstream route as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRoute {
    /// Key referenced by the global options' `route_keys`
    #[serde(default)]
    pub key: Option<String>,

    /// Upstream path template, e.g. `/api/users/{id}`
    pub upstream_path_template: String,

    /// Accepted methods; empty accepts any
    #[serde(default)]
    pub upstream_http_method: Vec<String>,

    /// Route-level rate limiting options
    #[serde(default)]
    pub rate_limit_options: Option<FileRateLimitOptions>,
}

/// Combine route and global options into the options the engine runs with.
///
/// Disabling at either level wins. Otherwise a section present at one level
/// only is used as-is; with both present and the global section covering
/// the route, route fields fall back to global ones.
pub fn merge_options(
    route: Option<&FileRateLimitOptions>,
    global: Option<&FileRateLimitOptions>,
    route_key: Option<&str>,
) -> Result<RateLimitOptions> {
    let is_global = global.map_or(true, |g| g.covers(route_key));

    let route_disabled = route.is_some_and(|r| r.enable_rate_limiting == Some(false));
    let global_disabled =
        is_global && global.is_some_and(|g| g.enable_rate_limiting == Some(false));
    if route_disabled || global_disabled {
        return Ok(RateLimitOptions::disabled());
    }

    match (route, global) {
        (Some(route), None) => route.to_options(),
        (None, Some(global)) if is_global => global.to_options(),
        (Some(route), Some(_)) if !is_global => route.to_options(),
        (Some(route), Some(global)) => route.merged_with(global).to_options(),
        _ => Ok(RateLimitOptions::disabled()),
    }
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }

        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every route yields valid options.
    pub fn validate(&self) -> Result<()> {
        self.build_routes().map(|_| ())
    }

    /// Build the routing table from the configured routes.
    pub fn route_table(&self) -> Result<RouteTable> {
        Ok(RouteTable::new(self.build_routes()?))
    }

    fn build_routes(&self) -> Result<Vec<Route>> {
        let global = self.global_rate_limit_options.as_ref();

        self.routes
            .iter()
            .map(|file_route| {
                let template = file_route.upstream_path_template.trim();
                if !template.starts_with('/') {
                    return Err(TurnstileError::Config(format!(
                        "upstream path template '{}' must start with '/'",
                        template
                    )));
                }

                let options = merge_options(
                    file_route.rate_limit_options.as_ref(),
                    global,
                    file_route.key.as_deref(),
                )
                .map_err(|e| {
                    TurnstileError::Config(format!("route '{}': {}", template, e))
                })?;

                debug!(route = %template, enabled = options.enabled, rule = %options.rule, "Configured route");

                let route = Route::new(template, &file_route.upstream_http_method, options);
                Ok(match &file_route.key {
                    Some(key) => route.with_key(key.clone()),
                    None => route,
                })
            })
            .collect()
    }
}
