use bifrost_core::StreamConverter;
use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::RequestKind;
use bifrost_protocol::StreamChunk;
use serde_json::Value;

use crate::route::RouteDescriptor;
use crate::route::RouteParams;

/// Provider inference order for a bare LiteLLM model string (spec §6:
/// "provider is derived from model substring (`gpt`,`claude`,`gemini`,
/// `bedrock`,`cohere`; default OpenAI)"). Order matters: first match wins;
/// collisions are resolved by this order.
const SUBSTRING_PROVIDERS: [(&str, &str); 5] =
    [("gpt", "openai"), ("claude", "anthropic"), ("gemini", "gemini"), ("bedrock", "bedrock"), ("cohere", "cohere")];

const DEFAULT_PROVIDER: &str = "openai";

fn infer_provider(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    for (needle, provider) in SUBSTRING_PROVIDERS {
        if lower.contains(needle) {
            return provider;
        }
    }
    DEFAULT_PROVIDER
}

fn to_normalized(mut body: Value, _params: &RouteParams) -> Result<NormalizedRequest, BifrostError> {
    let model_field = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| BifrostError::bad_request("missing `model`"))?
        .to_string();

    let (provider, model) = match bifrost_protocol::parse_model(&model_field) {
        Ok(pair) => pair,
        Err(_) => (infer_provider(&model_field).to_string(), model_field),
    };

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if let Some(obj) = body.as_object_mut() {
        obj.remove("model");
    }

    let mut req = NormalizedRequest::new(provider, model, RequestKind::ChatCompletion, body);
    req.stream = stream;
    Ok(req)
}

fn from_response(body: Value) -> Result<Value, BifrostError> {
    Ok(body)
}

fn from_error(err: &BifrostError) -> Value {
    let canonical = err.to_canonical_body();
    serde_json::json!({
        "error": {
            "message": canonical.error.message,
            "type": canonical.error.error_type,
            "code": canonical.error.code,
        }
    })
}

struct LiteLlmStreamConverter;
impl StreamConverter for LiteLlmStreamConverter {
    fn convert(&self, chunk: &StreamChunk) -> Option<Value> {
        Some(chunk.body.clone())
    }
}

pub fn chat_completions_route() -> RouteDescriptor {
    RouteDescriptor {
        method: http::Method::POST,
        path: "/litellm/v1/chat/completions",
        kind: RequestKind::ChatCompletion,
        resolve_kind: None,
        parse_request: RouteDescriptor::parse_request_json,
        pre_callback: None,
        short_circuit: None,
        to_normalized,
        from_response,
        from_error,
        stream_converter: Some(|| Box::new(LiteLlmStreamConverter)),
        post_callback: None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::route::RouteOutcome;

    fn provider_for(model: &str) -> String {
        let route = chat_completions_route();
        let body = serde_json::json!({"model": model, "messages": []});
        let raw = serde_json::to_vec(&body).unwrap();
        let RouteOutcome::Normalized(req) = route.handle(&RouteParams::default(), &raw).unwrap() else {
            panic!("expected normalized request")
        };
        req.provider
    }

    #[test]
    fn infers_anthropic_from_claude_substring() {
        assert_eq!(provider_for("claude-3-5-sonnet"), "anthropic");
    }

    #[test]
    fn infers_gemini_from_gemini_substring() {
        assert_eq!(provider_for("gemini-2.0-flash"), "gemini");
    }

    #[test]
    fn infers_bedrock_and_cohere() {
        assert_eq!(provider_for("bedrock-titan"), "bedrock");
        assert_eq!(provider_for("cohere-command-r"), "cohere");
    }

    #[test]
    fn defaults_to_openai_for_gpt_and_unknown_models() {
        assert_eq!(provider_for("gpt-4o"), "openai");
        assert_eq!(provider_for("some-custom-model"), "openai");
    }

    #[test]
    fn slash_qualified_model_bypasses_substring_inference() {
        assert_eq!(provider_for("azure/gpt-4-deploy"), "azure");
    }

    #[test]
    fn gpt_wins_collision_with_lower_priority_substrings() {
        assert_eq!(provider_for("my-gpt-claude-proxy"), "openai");
    }
}
