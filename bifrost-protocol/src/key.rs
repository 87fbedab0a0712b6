use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::BifrostError;

/// An authenticated credential against a provider (spec §3 "Key").
///
/// `weight == 0.0` means "eligible but always ordered last" rather than
/// "ineligible" — see `bifrost_selector::sort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub value: String,
    /// Empty means "all models accepted".
    #[serde(default)]
    pub models: Vec<String>,
    pub weight: f64,
    /// Provider-specific sub-configuration (e.g. Azure deployment id), left
    /// opaque here because the concrete shape is provider scope (spec §1).
    #[serde(default)]
    pub provider_config: Value,
}

impl Key {
    pub fn validate(&self) -> Result<(), BifrostError> {
        if self.weight < 0.0 {
            return Err(BifrostError::bad_request(format!(
                "key `{}` has negative weight {}",
                self.id, self.weight
            )));
        }
        Ok(())
    }

    /// Whether this key may serve the given model (spec §3 Key invariant).
    pub fn permits_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}
