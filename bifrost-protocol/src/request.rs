use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::BifrostError;

/// The logical shape of an inference call (spec §3 "Request fingerprint").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    TextCompletion,
    ChatCompletion,
    Responses,
    Embedding,
    Rerank,
    Speech,
    Transcription,
    ImageGeneration,
    ImageEdit,
    VideoGeneration,
    VideoRetrieve,
    ListModels,
    CountTokens,
    FileUpload,
    FileList,
    FileRetrieve,
    FileDelete,
    FileContent,
    BatchCreate,
    BatchList,
    BatchRetrieve,
    BatchCancel,
    BatchDelete,
    BatchResults,
}

impl RequestKind {
    /// Whether this kind has a streaming counterpart that the relay (§4.I)
    /// is ever asked to carry. Non-exhaustive by design: new kinds default
    /// to non-streaming until a stream converter is registered for them.
    pub fn supports_streaming(self) -> bool {
        matches!(
            self,
            RequestKind::TextCompletion
                | RequestKind::ChatCompletion
                | RequestKind::Responses
                | RequestKind::Speech
                | RequestKind::ImageGeneration
        )
    }
}

/// One entry of an ordered fallback list: `(provider, model)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fallback {
    pub provider: String,
    pub model: String,
}

/// A request normalised to the internal shape the dispatcher (§4.H) operates
/// on. `input`/`params` stay as opaque JSON: this crate does not specify the
/// concrete per-provider wire bodies (spec §1 Non-goal), only the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub provider: String,
    pub model: String,
    pub kind: RequestKind,
    pub input: Value,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub fallbacks: Vec<Fallback>,
    #[serde(default)]
    pub stream: bool,
}

impl NormalizedRequest {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, kind: RequestKind, input: Value) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            kind,
            input,
            params: None,
            fallbacks: Vec::new(),
            stream: false,
        }
    }
}

/// Splits a `"provider/model-rest"` string into its two halves.
///
/// Both sides are trimmed and must be non-empty after trimming. Only the
/// first `/` is significant: `model-rest` may itself contain further `/`
/// characters (spec §6 "Model string grammar", Testable Property 12).
pub fn parse_model(spec: &str) -> Result<(String, String), BifrostError> {
    let Some(slash) = spec.find('/') else {
        return Err(BifrostError::bad_request(format!(
            "model string `{spec}` is missing a `/` separator"
        )));
    };
    let provider = spec[..slash].trim();
    let model = spec[slash + 1..].trim();
    if provider.is_empty() || model.is_empty() {
        return Err(BifrostError::bad_request(format!(
            "model string `{spec}` must have a non-empty provider and model"
        )));
    }
    Ok((provider.to_string(), model.to_string()))
}

/// Strips a trailing Gemini-style verb suffix (`:generateContent`, and so on)
/// from a model string read off a URL path, before the rest of dispatch sees it.
pub fn strip_provider_suffix(model_path: &str) -> &str {
    const SUFFIXES: &[&str] = &[
        ":predict",
        ":streamGenerateContent",
        ":embedContent",
        ":batchEmbedContents",
        ":predictLongRunning",
        ":batchGenerateContent",
        ":countTokens",
        ":generateContent",
    ];
    for suffix in SUFFIXES {
        if let Some(stripped) = model_path.strip_suffix(suffix) {
            return stripped;
        }
    }
    model_path
}
