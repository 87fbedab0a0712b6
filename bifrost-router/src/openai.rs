use bifrost_core::StreamConverter;
use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::RequestKind;
use bifrost_protocol::StreamChunk;
use serde_json::Value;

use crate::route::RouteDescriptor;
use crate::route::RouteParams;

/// `POST /v1/chat/completions` (spec §6). `model` is `"provider/model"`;
/// everything else passes through as opaque `params`.
fn to_normalized(mut body: Value, _params: &RouteParams) -> Result<NormalizedRequest, BifrostError> {
    let model_field = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| BifrostError::bad_request("missing `model`"))?
        .to_string();
    let (provider, model) = crate::route::parse_provider_model(&model_field)?;

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let fallbacks = body
        .get("fallbacks")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .map(|s| crate::route::parse_provider_model(s).map(|(provider, model)| bifrost_protocol::Fallback { provider, model }))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    if let Some(obj) = body.as_object_mut() {
        obj.remove("model");
        obj.remove("fallbacks");
    }

    let mut req = NormalizedRequest::new(provider, model, RequestKind::ChatCompletion, body);
    req.stream = stream;
    req.fallbacks = fallbacks;
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

struct ChatCompletionsStreamConverter;
impl StreamConverter for ChatCompletionsStreamConverter {
    fn convert(&self, chunk: &StreamChunk) -> Option<Value> {
        Some(chunk.body.clone())
    }
    fn emits_done_sentinel(&self) -> bool {
        true
    }
}

pub fn chat_completions_route() -> RouteDescriptor {
    RouteDescriptor {
        method: http::Method::POST,
        path: "/v1/chat/completions",
        kind: RequestKind::ChatCompletion,
        resolve_kind: None,
        parse_request: RouteDescriptor::parse_request_json,
        pre_callback: None,
        short_circuit: None,
        to_normalized,
        from_response,
        from_error,
        stream_converter: Some(|| Box::new(ChatCompletionsStreamConverter)),
        post_callback: None,
    }
}
