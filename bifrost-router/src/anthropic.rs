use bifrost_core::StreamConverter;
use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::RequestKind;
use bifrost_protocol::StreamChunk;
use serde_json::Value;

use crate::route::RouteDescriptor;
use crate::route::RouteParams;

const DEFAULT_PROVIDER: &str = "anthropic";

/// `POST /anthropic/v1/messages`. Anthropic's wire format names a bare model
/// (`claude-3-5-sonnet-latest`), not `provider/model`; a `/` is still
/// honoured so a request can target a non-default provider explicitly.
fn to_normalized(mut body: Value, _params: &RouteParams) -> Result<NormalizedRequest, BifrostError> {
    let model_field = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| BifrostError::bad_request("missing `model`"))?
        .to_string();
    let (provider, model) = match bifrost_protocol::parse_model(&model_field) {
        Ok(pair) => pair,
        Err(_) => (DEFAULT_PROVIDER.to_string(), model_field),
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
        "type": "error",
        "error": {
            "type": canonical.error.error_type,
            "message": canonical.error.message,
        }
    })
}

struct MessagesStreamConverter;
impl StreamConverter for MessagesStreamConverter {
    fn convert(&self, chunk: &StreamChunk) -> Option<Value> {
        Some(chunk.body.clone())
    }
}

pub fn messages_route() -> RouteDescriptor {
    RouteDescriptor {
        method: http::Method::POST,
        path: "/anthropic/v1/messages",
        kind: RequestKind::ChatCompletion,
        resolve_kind: None,
        parse_request: RouteDescriptor::parse_request_json,
        pre_callback: None,
        short_circuit: None,
        to_normalized,
        from_response,
        from_error,
        stream_converter: Some(|| Box::new(MessagesStreamConverter)),
        post_callback: None,
    }
}
