//! The concrete `ProviderAdapter`/`StreamingProviderAdapter` the dispatcher
//! (§4.H) calls out through: one HTTP request per attempt, built from the
//! route table's already-normalised request and the selected key (spec §1
//! leaves the concrete wire body to the integration router, so this layer
//! only owns transport: URL, auth header, retryable-error mapping).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bifrost_client::HttpTransport;
use bifrost_client::Request;
use bifrost_client::TransportError;
use bifrost_core::BifrostContext;
use bifrost_core::ProviderAdapter;
use bifrost_core::StreamingProviderAdapter;
use bifrost_core::decode_sse_stream;
use bifrost_protocol::BifrostError;
use bifrost_protocol::ErrorKind;
use bifrost_protocol::ExtraFields;
use bifrost_protocol::Key;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::StreamChunk;
use futures::stream::BoxStream;
use http::Method;
use http::header::AUTHORIZATION;
use serde_json::Value;

/// Maps a normalised request's kind to the wire path appended to a
/// provider's configured base URL. Concrete per-provider wire shapes are
/// out of scope (spec §1); this only picks the path, the body travels
/// through unchanged as `req.input`.
fn wire_path_for(kind: bifrost_protocol::RequestKind) -> &'static str {
    use bifrost_protocol::RequestKind::*;
    match kind {
        ChatCompletion => "/v1/chat/completions",
        TextCompletion => "/v1/completions",
        Responses => "/v1/responses",
        Embedding => "/v1/embeddings",
        Speech => "/v1/audio/speech",
        Transcription => "/v1/audio/transcriptions",
        ImageGeneration | ImageEdit => "/v1/images/generations",
        _ => "/v1/chat/completions",
    }
}

pub struct HttpProviderAdapter {
    transport: Arc<dyn HttpTransport>,
    base_urls: HashMap<String, String>,
}

impl HttpProviderAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, base_urls: HashMap<String, String>) -> Self {
        Self { transport, base_urls }
    }

    fn endpoint_for(&self, req: &NormalizedRequest) -> Result<String, BifrostError> {
        let base = self
            .base_urls
            .get(&req.provider)
            .ok_or_else(|| BifrostError::not_found(format!("no base_url configured for provider `{}`", req.provider)))?;
        Ok(format!("{}{}", base.trim_end_matches('/'), wire_path_for(req.kind)))
    }

    fn build_request(&self, key: &Key, req: &NormalizedRequest) -> Result<Request, BifrostError> {
        let url = self.endpoint_for(req)?;
        let auth = http::HeaderValue::from_str(&format!("Bearer {}", key.value))
            .map_err(|e| BifrostError::internal(format!("key value is not a valid header value: {e}")))?;
        Ok(Request::new(Method::POST, url).with_json(&req.input).with_header(AUTHORIZATION, auth))
    }
}

/// Maps a transport-level failure to the dispatcher's retry taxonomy (spec
/// §4.H step 4): only `RateLimited`/`Upstream`/`Timeout` are retried.
fn map_transport_error(err: TransportError) -> BifrostError {
    match err {
        TransportError::Timeout => BifrostError::new(ErrorKind::Timeout, "upstream request timed out"),
        TransportError::Build(message) => BifrostError::internal(format!("failed to build upstream request: {message}")),
        TransportError::Network(message) => BifrostError::new(ErrorKind::Upstream, format!("upstream network error: {message}")),
        TransportError::Http { status, body, .. } => {
            let message = body.unwrap_or_else(|| status.to_string());
            let kind = match status.as_u16() {
                429 => ErrorKind::RateLimited,
                400..=499 => ErrorKind::BadRequest,
                _ => ErrorKind::Upstream,
            };
            BifrostError::new(kind, message)
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn call(&self, key: &Key, req: &NormalizedRequest, _ctx: &BifrostContext) -> Result<Value, BifrostError> {
        let request = self.build_request(key, req)?;
        let response = self.transport.execute(request).await.map_err(map_transport_error)?;
        response.json::<Value>().map_err(|e| BifrostError::internal(format!("failed to decode upstream response: {e}")))
    }
}

#[async_trait]
impl StreamingProviderAdapter for HttpProviderAdapter {
    async fn call_stream(
        &self,
        key: &Key,
        req: &NormalizedRequest,
        _ctx: &BifrostContext,
    ) -> Result<BoxStream<'static, Result<StreamChunk, BifrostError>>, BifrostError> {
        let request = self.build_request(key, req)?;
        let stream_response = self.transport.stream(request).await.map_err(map_transport_error)?;
        let extra = ExtraFields { provider: req.provider.clone(), request_kind: req.kind, model_requested: req.model.clone() };
        Ok(decode_sse_stream(stream_response.bytes, extra))
    }
}
