use std::time::Duration;

use bifrost_protocol::BifrostError;
use bifrost_protocol::ProviderConfig;
use serde::Deserialize;
use serde::Serialize;

/// MCP code-mode binding level (spec §4.M): must be `server` or `tool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpBindingLevel {
    Server,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    pub binding_level: McpBindingLevel,
    #[serde(with = "millis")]
    pub depth: Duration,
    #[serde(with = "millis")]
    pub timeout: Duration,
}

/// The live configuration snapshot (spec §4.M). Fields are grouped by
/// reload tier: `Hot` fields may be swapped in place via `ArcSwap`; `Cold`
/// fields require a process restart and only ever take effect from the
/// config that was loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cold: the dispatcher and its provider slots are built once from this
    /// list at startup (spec §4.H); adding or removing a provider takes a
    /// restart rather than a hot update.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    pub allowed_origins: Vec<String>,
    pub initial_pool_size: usize,
    pub drop_excess_requests: bool,
    pub max_request_body_size_mb: u64,
    pub blocked_headers: Vec<String>,
    pub proxy: Option<String>,
    pub mcp: McpConfig,
    #[serde(with = "millis")]
    pub retry_backoff_min: Duration,
    #[serde(with = "millis")]
    pub retry_backoff_max_bound: Duration,
    pub governance_enabled: bool,
    pub semantic_cache_enabled: bool,
    pub logging_enabled: bool,
    pub direct_keys_enabled: bool,
    pub fallbacks_enabled: bool,
}

/// A header name that may never appear in a user-configured allow/deny list
/// (spec §4.K "Security-header guard"), checked case-insensitively with
/// whitespace trimmed.
const ALWAYS_BLOCKED_HEADERS: [&str; 11] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "x-api-key",
    "x-goog-api-key",
    "x-bf-api-key",
    "x-bf-vk",
];

pub fn is_always_blocked_header(name: &str) -> bool {
    let normalized = name.trim().to_ascii_lowercase();
    ALWAYS_BLOCKED_HEADERS.contains(&normalized.as_str())
}

/// Explains why a config update could not be applied in place (spec §4.M:
/// "the update handler sets a restart-required marker with a reason string").
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("restart required: {reason}")]
pub struct RestartRequired {
    pub reason: String,
}

impl Config {
    /// Applies the subset of fields spec §4.M marks hot-reloadable, leaving
    /// everything else untouched; cold-field changes are rejected with a
    /// `RestartRequired` reason instead of silently taking effect.
    pub fn apply_hot_update(&mut self, update: &ConfigUpdate) -> Result<(), RestartRequired> {
        if let Some(pool_size) = update.initial_pool_size
            && pool_size != self.initial_pool_size
        {
            return Err(RestartRequired { reason: "initial_pool_size requires a restart to resize pools".to_string() });
        }
        if let Some(max_body) = update.max_request_body_size_mb
            && max_body != self.max_request_body_size_mb
        {
            return Err(RestartRequired { reason: "max_request_body_size_mb requires a restart".to_string() });
        }

        if let Some(drop_excess) = update.drop_excess_requests {
            self.drop_excess_requests = drop_excess;
        }
        if let Some(mcp) = &update.mcp {
            mcp.validate()?;
            self.mcp = mcp.clone();
        }
        if let Some(headers) = &update.blocked_headers {
            self.blocked_headers = headers.clone();
        }
        if let Some(governance) = update.governance_enabled {
            self.governance_enabled = governance;
        }
        if let Some(direct_keys) = update.direct_keys_enabled {
            self.direct_keys_enabled = direct_keys;
        }
        if let Some(fallbacks) = update.fallbacks_enabled {
            self.fallbacks_enabled = fallbacks;
        }
        Ok(())
    }

    /// Retry backoff bounds must satisfy `Min <= Initial <= Max <= MaxBound`
    /// (spec §4.M, Testable Property 14), checked against a candidate
    /// per-provider `NetworkConfig`.
    pub fn validate_network(&self, network: &bifrost_protocol::NetworkConfig) -> Result<(), BifrostError> {
        network.validate(self.retry_backoff_min, self.retry_backoff_max_bound)
    }
}

impl McpConfig {
    fn validate(&self) -> Result<(), RestartRequired> {
        if self.depth.is_zero() || self.timeout.is_zero() {
            return Err(RestartRequired { reason: "mcp depth and timeout must be positive".to_string() });
        }
        Ok(())
    }
}

/// A partial update applied via the hot-reload endpoint; `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub initial_pool_size: Option<usize>,
    pub drop_excess_requests: Option<bool>,
    pub max_request_body_size_mb: Option<u64>,
    pub blocked_headers: Option<Vec<String>>,
    pub mcp: Option<McpConfig>,
    pub governance_enabled: Option<bool>,
    pub direct_keys_enabled: Option<bool>,
    pub fallbacks_enabled: Option<bool>,
}

mod millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
