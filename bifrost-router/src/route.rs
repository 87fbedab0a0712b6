use std::collections::HashMap;

use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::RequestKind;
use bifrost_core::StreamConverter;
use http::Method;
use serde_json::Value;

/// Path parameters and per-request hints threaded through a route's
/// callbacks (spec §4.J steps 4, 7). Populated by the server bootstrap from
/// the URL before `handle` runs.
#[derive(Debug, Default, Clone)]
pub struct RouteParams {
    pub path_params: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
}

impl RouteParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }
}

/// A direct answer from step 5, bypassing the dispatcher (spec §4.J step 5).
/// Carries response headers as well as a body so routes like Gemini's
/// resumable-upload step 1 can answer entirely through headers with an
/// empty body (spec §6).
#[derive(Debug, Clone, Default)]
pub struct ShortCircuitResponse {
    pub body: Value,
    pub headers: http::HeaderMap,
}

impl ShortCircuitResponse {
    pub fn with_body(body: Value) -> Self {
        Self { body, headers: http::HeaderMap::new() }
    }
}

/// Outcome of running a route through steps 1-5 of §4.J.
pub enum RouteOutcome {
    /// The request converter produced a normalised request ready for §4.H.
    Normalized(NormalizedRequest),
    /// A `short_circuit` callback answered the request directly.
    ShortCircuit(ShortCircuitResponse),
}

/// One entry of the integration route table (spec §4.J, §3 "Integration
/// route"). Free-function fields rather than a trait object per entry,
/// mirroring the teacher's per-endpoint-file-of-free-functions shape
/// (`codex-api/src/endpoint/*.rs`) generalised into a data table (REDESIGN
/// FLAGS: table dispatch over duck-typed per-kind handlers).
#[derive(Clone)]
pub struct RouteDescriptor {
    pub method: Method,
    pub path: &'static str,
    pub kind: RequestKind,

    /// Step 1: some routes (Gemini's suffix-dispatched `{model:*}`) only
    /// know their real kind once the path is parsed; when present this
    /// overrides `kind` for that request.
    pub resolve_kind: Option<fn(&RouteParams) -> RequestKind>,

    /// Step 3: default is JSON-unmarshal; routes needing multipart or a
    /// raw passthrough (file upload, TTS) override this.
    pub parse_request: fn(&[u8]) -> Result<Value, BifrostError>,

    /// Step 4: extract path params, set provider/per-route flags. Runs
    /// before `short_circuit`.
    pub pre_callback: Option<fn(&mut Value, &RouteParams) -> Result<(), BifrostError>>,

    /// Step 5: if it returns `Some`, the route answers without dispatching.
    pub short_circuit: Option<fn(&Value, &RouteParams) -> Option<ShortCircuitResponse>>,

    /// Step 6a: produce the normalised request the dispatcher consumes.
    pub to_normalized: fn(Value, &RouteParams) -> Result<NormalizedRequest, BifrostError>,

    /// Step 6b: translate the dispatcher's raw JSON response back to this
    /// integration's wire shape.
    pub from_response: fn(Value) -> Result<Value, BifrostError>,

    /// Step 6c: translate a canonical error into this integration's error
    /// wire shape, used instead of `to_canonical_body` on this route.
    pub from_error: fn(&BifrostError) -> Value,

    /// Present only for routes whose kind supports streaming (spec §3
    /// `RequestKind::supports_streaming`).
    pub stream_converter: Option<fn() -> Box<dyn StreamConverter>>,

    /// Step 7: e.g. set `X-Goog-Upload-Status: final`.
    pub post_callback: Option<fn(&mut http::HeaderMap)>,
}

impl RouteDescriptor {
    /// `self.kind` unless `resolve_kind` overrides it for this request
    /// (spec §4.J step 1).
    pub fn effective_kind(&self, params: &RouteParams) -> RequestKind {
        self.resolve_kind.map(|resolve| resolve(params)).unwrap_or(self.kind)
    }

    pub fn parse_request_json(body: &[u8]) -> Result<Value, BifrostError> {
        serde_json::from_slice(body).map_err(|e| BifrostError::bad_request(format!("invalid JSON body: {e}")))
    }

    /// Runs steps 1-5 (kind is read from `self.kind` per-route) and returns
    /// either the normalised request or a short-circuit response.
    pub fn handle(&self, params: &RouteParams, raw_body: &[u8]) -> Result<RouteOutcome, BifrostError> {
        let mut value = (self.parse_request)(raw_body)?;

        if let Some(pre) = self.pre_callback {
            pre(&mut value, params)?;
        }

        if let Some(short_circuit) = self.short_circuit
            && let Some(response) = short_circuit(&value, params)
        {
            tracing::debug!(path = self.path, "route short-circuited before dispatch");
            return Ok(RouteOutcome::ShortCircuit(response));
        }

        let normalized = (self.to_normalized)(value, params)?;
        Ok(RouteOutcome::Normalized(normalized))
    }
}

/// Splits `"provider/model-rest"`, delegating to the canonical parser (spec
/// §4.J "Helpers required for every integration").
pub fn parse_provider_model(spec: &str) -> Result<(String, String), BifrostError> {
    bifrost_protocol::parse_model(spec)
}
