use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::BifrostError;
use crate::key::Key;

/// Network timeouts/retry bounds for one provider (spec §3 "Provider config").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub retry_backoff_initial: Duration,
    #[serde(with = "duration_millis")]
    pub retry_backoff_max: Duration,
}

impl NetworkConfig {
    /// Validates `RetryBackoffInitial <= RetryBackoffMax`, both within the
    /// server-wide `[min, max]` bounds (spec §3, Testable Property 14).
    pub fn validate(&self, server_min: Duration, server_max: Duration) -> Result<(), BifrostError> {
        if self.retry_backoff_initial > self.retry_backoff_max {
            return Err(BifrostError::bad_request(format!(
                "retry backoff initial ({:?}) must be <= max ({:?})",
                self.retry_backoff_initial, self.retry_backoff_max
            )));
        }
        if self.retry_backoff_initial < server_min || self.retry_backoff_initial > server_max {
            return Err(BifrostError::bad_request(format!(
                "retry backoff initial {:?} out of server bounds [{server_min:?}, {server_max:?}]",
                self.retry_backoff_initial
            )));
        }
        if self.retry_backoff_max < server_min || self.retry_backoff_max > server_max {
            return Err(BifrostError::bad_request(format!(
                "retry backoff max {:?} out of server bounds [{server_min:?}, {server_max:?}]",
                self.retry_backoff_max
            )));
        }
        Ok(())
    }

    /// `min(backoff_initial * 2^attempt, backoff_max)`, unjittered; callers
    /// apply jitter themselves (§4.H step 4).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.retry_backoff_initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.retry_backoff_max)
    }
}

/// In-flight request buffer sizing for one provider (spec §3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub limit: usize,
    pub buffer: usize,
    #[serde(default)]
    pub drop_excess_requests: bool,
}

impl ConcurrencyConfig {
    pub fn validate(&self) -> Result<(), BifrostError> {
        if !(self.limit > 0 && self.limit <= self.buffer) {
            return Err(BifrostError::bad_request(format!(
                "concurrency config requires 0 < limit ({}) <= buffer ({})",
                self.limit, self.buffer
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Only meaningful when `name` denotes a custom provider.
    #[serde(default)]
    pub base_provider_type: Option<String>,
    pub keys: Vec<Key>,
    pub network: NetworkConfig,
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    pub fn validate(&self, server_min: Duration, server_max: Duration) -> Result<(), BifrostError> {
        self.concurrency.validate()?;
        self.network.validate(server_min, server_max)?;
        for key in &self.keys {
            key.validate()?;
        }
        Ok(())
    }

    /// Keys eligible for `model`: non-empty `models` list must contain it.
    pub fn eligible_keys(&self, model: &str) -> Vec<Key> {
        self.keys.iter().filter(|k| k.permits_model(model)).cloned().collect()
    }

    /// Azure/custom base-URL sniffing, mirroring the teacher's
    /// `is_azure_responses_wire_base_url` heuristic: some providers are
    /// identified by name, others by markers in their base URL.
    pub fn is_azure_like(&self) -> bool {
        if self.name.eq_ignore_ascii_case("azure") {
            return true;
        }
        let Some(base_url) = self.base_url.as_deref() else {
            return false;
        };
        let base = base_url.to_ascii_lowercase();
        const MARKERS: [&str; 6] = [
            "openai.azure.",
            "cognitiveservices.azure.",
            "aoai.azure.",
            "azure-api.",
            "azurefd.",
            "windows.net/openai",
        ];
        MARKERS.iter().any(|marker| base.contains(marker))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
