use bifrost_core::StreamConverter;
use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::RequestKind;
use bifrost_protocol::StreamChunk;
use serde_json::Value;

use crate::route::RouteDescriptor;
use crate::route::RouteParams;

/// `POST /v1/responses` (spec §6, §4.I). Shares `openai.rs`'s
/// `provider/model` convention; the WS-native relay (§4.I) dials this same
/// normalised request's provider/model once a session pins an upstream.
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

    let mut req = NormalizedRequest::new(provider, model, RequestKind::Responses, body);
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

struct ResponsesStreamConverter;
impl StreamConverter for ResponsesStreamConverter {
    fn convert(&self, chunk: &StreamChunk) -> Option<Value> {
        Some(chunk.body.clone())
    }
}

pub fn responses_route() -> RouteDescriptor {
    RouteDescriptor {
        method: http::Method::POST,
        path: "/v1/responses",
        kind: RequestKind::Responses,
        resolve_kind: None,
        parse_request: RouteDescriptor::parse_request_json,
        pre_callback: None,
        short_circuit: None,
        to_normalized,
        from_response,
        from_error,
        stream_converter: Some(|| Box::new(ResponsesStreamConverter)),
        post_callback: None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::route::RouteOutcome;

    #[test]
    fn splits_provider_and_model_and_strips_routing_fields() {
        let route = responses_route();
        let body = serde_json::json!({
            "model": "openai/gpt-4.1",
            "input": "hello",
            "stream": true,
            "fallbacks": ["azure/gpt-4-deploy"],
        });
        let raw = serde_json::to_vec(&body).unwrap();
        let RouteOutcome::Normalized(req) = route.handle(&RouteParams::default(), &raw).unwrap() else {
            panic!("expected normalized request")
        };
        assert_eq!(req.provider, "openai");
        assert_eq!(req.model, "gpt-4.1");
        assert!(req.stream);
        assert_eq!(req.fallbacks.len(), 1);
        assert_eq!(req.kind, RequestKind::Responses);
    }

    #[test]
    fn missing_model_is_a_bad_request() {
        let route = responses_route();
        let raw = serde_json::to_vec(&serde_json::json!({"input": "hi"})).unwrap();
        let err = route.handle(&RouteParams::default(), &raw).unwrap_err();
        assert!(matches!(err.kind, bifrost_protocol::ErrorKind::BadRequest));
    }
}
