use bifrost_core::StreamConverter;
use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::RequestKind;
use bifrost_protocol::StreamChunk;
use serde_json::Value;

use crate::route::RouteDescriptor;
use crate::route::RouteParams;
use crate::route::ShortCircuitResponse;

const MODEL_PATH_PARAM: &str = "model";

/// Maps a Gemini verb suffix to the request kind it dispatches as (spec §6
/// "Gemini dispatch"). `strip_provider_suffix` already knows the suffix list;
/// this mirrors it for kind resolution.
fn kind_for_suffix(model_path: &str) -> RequestKind {
    if model_path.ends_with(":streamGenerateContent") || model_path.ends_with(":generateContent") {
        RequestKind::ChatCompletion
    } else if model_path.ends_with(":embedContent") || model_path.ends_with(":batchEmbedContents") {
        RequestKind::Embedding
    } else if model_path.ends_with(":countTokens") {
        RequestKind::CountTokens
    } else if model_path.ends_with(":predictLongRunning") {
        RequestKind::VideoGeneration
    } else if model_path.ends_with(":batchGenerateContent") {
        RequestKind::BatchCreate
    } else if model_path.ends_with(":predict") {
        RequestKind::ImageGeneration
    } else {
        RequestKind::ChatCompletion
    }
}

fn resolve_kind(params: &RouteParams) -> RequestKind {
    params.get(MODEL_PATH_PARAM).map(kind_for_suffix).unwrap_or(RequestKind::ChatCompletion)
}

fn to_normalized(body: Value, params: &RouteParams) -> Result<NormalizedRequest, BifrostError> {
    let model_path = params.get(MODEL_PATH_PARAM).ok_or_else(|| BifrostError::bad_request("missing model path segment"))?;
    let kind = kind_for_suffix(model_path);
    let model = bifrost_protocol::strip_provider_suffix(model_path).to_string();
    let stream = model_path.ends_with(":streamGenerateContent");

    let mut req = NormalizedRequest::new("gemini", model, kind, body);
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
            "code": canonical.status_code,
            "message": canonical.error.message,
            "status": canonical.error.error_type.to_uppercase(),
        }
    })
}

struct GenerateContentStreamConverter;
impl StreamConverter for GenerateContentStreamConverter {
    fn convert(&self, chunk: &StreamChunk) -> Option<Value> {
        Some(chunk.body.clone())
    }
    /// Gemini's own SSE bridge does not send a `[DONE]` sentinel (spec §9).
    fn emits_done_sentinel(&self) -> bool {
        false
    }
}

pub fn generate_content_route() -> RouteDescriptor {
    RouteDescriptor {
        method: http::Method::POST,
        path: "/genai/v1beta/models/{model:*}",
        kind: RequestKind::ChatCompletion,
        resolve_kind: Some(resolve_kind),
        parse_request: RouteDescriptor::parse_request_json,
        pre_callback: None,
        short_circuit: None,
        to_normalized,
        from_response,
        from_error,
        stream_converter: Some(|| Box::new(GenerateContentStreamConverter)),
        post_callback: None,
    }
}

/// Resumable upload step 1: the upload URL goes in `X-Goog-Upload-URL`, not
/// the body, which stays empty (spec §6: step 1 response is an empty JSON
/// object with `X-Goog-Upload-URL` and `X-Goog-Upload-Status: active`
/// headers).
fn upload_short_circuit(_body: &Value, params: &RouteParams) -> Option<ShortCircuitResponse> {
    let upload_id = params.query("upload_id").map(str::to_string).unwrap_or_else(|| "upload-1".to_string());
    let url = format!("/genai/upload/v1beta/files?upload_id={upload_id}");

    let mut headers = http::HeaderMap::new();
    let Ok(url_value) = http::HeaderValue::from_str(&url) else {
        return Some(ShortCircuitResponse::with_body(serde_json::json!({})));
    };
    headers.insert("x-goog-upload-url", url_value);
    headers.insert("x-goog-upload-status", http::HeaderValue::from_static("active"));
    Some(ShortCircuitResponse { body: serde_json::json!({}), headers })
}

fn upload_to_normalized(_body: Value, _params: &RouteParams) -> Result<NormalizedRequest, BifrostError> {
    unreachable!("upload step 1 always short-circuits before reaching the request converter")
}

fn upload_from_response(body: Value) -> Result<Value, BifrostError> {
    Ok(body)
}

pub fn upload_files_route() -> RouteDescriptor {
    RouteDescriptor {
        method: http::Method::POST,
        path: "/genai/upload/v1beta/files",
        kind: RequestKind::FileUpload,
        resolve_kind: None,
        parse_request: RouteDescriptor::parse_request_json,
        pre_callback: None,
        short_circuit: Some(upload_short_circuit),
        to_normalized: upload_to_normalized,
        from_response: upload_from_response,
        from_error,
        stream_converter: None,
        post_callback: Some(|headers| {
            headers.insert("x-goog-upload-status", http::HeaderValue::from_static("final"));
        }),
    }
}

/// Strips a trailing `:cancel` suffix from a batch id path segment (spec §6
/// "`batchID` strips a `:cancel` suffix").
pub fn strip_batch_cancel_suffix(batch_id: &str) -> (&str, bool) {
    match batch_id.strip_suffix(":cancel") {
        Some(stripped) => (stripped, true),
        None => (batch_id, false),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::route::RouteOutcome;

    fn params_with_model(model_path: &str) -> RouteParams {
        let mut params = RouteParams::default();
        params.path_params.insert(MODEL_PATH_PARAM.to_string(), model_path.to_string());
        params
    }

    #[test]
    fn generate_content_suffix_resolves_to_chat_completion() {
        let route = generate_content_route();
        let params = params_with_model("gemini-2.0-flash:generateContent");
        assert_eq!(route.effective_kind(&params), RequestKind::ChatCompletion);
        let raw = serde_json::to_vec(&serde_json::json!({"contents": []})).unwrap();
        let RouteOutcome::Normalized(req) = route.handle(&params, &raw).unwrap() else { panic!("expected normalized") };
        assert_eq!(req.model, "gemini-2.0-flash");
        assert!(!req.stream);
    }

    #[test]
    fn stream_generate_content_is_marked_streaming() {
        let route = generate_content_route();
        let params = params_with_model("gemini-2.0-flash:streamGenerateContent");
        let raw = serde_json::to_vec(&serde_json::json!({"contents": []})).unwrap();
        let RouteOutcome::Normalized(req) = route.handle(&params, &raw).unwrap() else { panic!("expected normalized") };
        assert!(req.stream);
    }

    #[test]
    fn embed_content_suffix_resolves_to_embedding() {
        let params = params_with_model("text-embedding-004:embedContent");
        assert_eq!(resolve_kind(&params), RequestKind::Embedding);
    }

    #[test]
    fn count_tokens_suffix_resolves_correctly() {
        let params = params_with_model("gemini-2.0-flash:countTokens");
        assert_eq!(resolve_kind(&params), RequestKind::CountTokens);
    }

    #[test]
    fn upload_step_one_short_circuits_with_an_upload_url_header_and_empty_body() {
        let route = upload_files_route();
        let mut params = RouteParams::default();
        params.query_params.insert("upload_id".to_string(), "abc123".to_string());
        let body = serde_json::json!({"file": {"displayName": "clip.mp4"}});
        let raw = serde_json::to_vec(&body).unwrap();
        let RouteOutcome::ShortCircuit(response) = route.handle(&params, &raw).unwrap() else {
            panic!("expected a short-circuit response")
        };
        assert_eq!(response.body, serde_json::json!({}));
        assert_eq!(response.headers.get("x-goog-upload-status").unwrap(), "active");
        let url = response.headers.get("x-goog-upload-url").unwrap().to_str().unwrap();
        assert!(url.contains("abc123"));
    }

    #[test]
    fn batch_cancel_suffix_is_stripped_and_flagged() {
        assert_eq!(strip_batch_cancel_suffix("batch-42:cancel"), ("batch-42", true));
        assert_eq!(strip_batch_cancel_suffix("batch-42"), ("batch-42", false));
    }
}
