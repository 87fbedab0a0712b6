//! Transport Interceptor Chain (spec §4.K): CORS, then (when governance is
//! loaded) a header/body rewrite pass, then the security-header guard.

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::body::to_bytes;
use axum::extract::Request;
use axum::extract::State;
use axum::http::HeaderName;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use tracing::warn;

use crate::config::Config;
use crate::config::is_always_blocked_header;
use crate::cors::is_origin_allowed;

const MAX_GOVERNANCE_BODY_BYTES: usize = 25 * 1024 * 1024;

/// A governance plugin's view of one request, applied by
/// `governance_middleware` when `Config.governance_enabled` (spec §4.K step
/// "Transport Interceptor"). Concrete policy (budgets, PII scanning, rate
/// limiting) is out of scope for this crate (spec §1 Non-goal); this is the
/// seam a governance plugin hangs off of.
#[async_trait::async_trait]
pub trait TransportInterceptor: Send + Sync {
    /// Inspects and may rewrite the snapshotted headers and parsed JSON
    /// body before the request continues down the chain. Returning `Err`
    /// aborts the request with a 500 (spec §4.K: "re-marshal failure is a
    /// 500").
    async fn intercept(&self, headers: &axum::http::HeaderMap, body: &mut serde_json::Value) -> Result<(), String>;
}

/// A no-op interceptor: passes every request through unchanged. Stands in
/// for a concrete governance plugin (budgets, PII redaction, ...), which is
/// out of scope for this crate.
pub struct AllowAllInterceptor;

#[async_trait::async_trait]
impl TransportInterceptor for AllowAllInterceptor {
    async fn intercept(&self, _headers: &axum::http::HeaderMap, _body: &mut serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// Axum middleware implementing §4.K's governance step: snapshots headers,
/// parses the body as JSON, runs it through `interceptor`, then re-marshals
/// the (possibly rewritten) body back onto the request. A body that isn't
/// JSON, or that fails to re-marshal, is a 500; a non-JSON body is treated
/// as an empty object so non-JSON routes (file upload) still pass through.
/// Only runs when `cfg.load().governance_enabled` is true.
pub async fn governance_middleware(State(state): State<crate::server::AppState>, req: Request, next: Next) -> Response {
    if !state.config.load().governance_enabled {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_GOVERNANCE_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "governance step failed to read request body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read request body").into_response();
        }
    };

    let mut value: serde_json::Value = if bytes.is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(_) => serde_json::json!({}),
        }
    };

    if let Err(reason) = state.interceptor.intercept(&parts.headers, &mut value).await {
        warn!(%reason, "governance interceptor rejected the request");
        return (StatusCode::INTERNAL_SERVER_ERROR, "governance interceptor failed").into_response();
    }

    let rewritten = match serde_json::to_vec(&value) {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(%err, "governance step failed to re-marshal the request body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to re-marshal request body").into_response();
        }
    };

    let req = Request::from_parts(parts, Body::from(rewritten));
    next.run(req).await
}

const ORIGIN: &str = "origin";
const ACCESS_CONTROL_ALLOW_ORIGIN: &str = "access-control-allow-origin";
const ACCESS_CONTROL_ALLOW_METHODS: &str = "access-control-allow-methods";
const ACCESS_CONTROL_ALLOW_HEADERS: &str = "access-control-allow-headers";

/// Axum middleware implementing the CORS step of spec §4.K: short-circuits
/// `OPTIONS` with 200/403 depending on `IsOriginAllowed`, otherwise adds the
/// standard CORS headers to whatever `next` produces.
pub async fn cors_middleware(State(cfg): State<Arc<ArcSwap<Config>>>, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allowed = origin.as_deref().is_some_and(|o| is_origin_allowed(o, &cfg.load().allowed_origins));

    if req.method() == axum::http::Method::OPTIONS {
        let status = if allowed { StatusCode::OK } else { StatusCode::FORBIDDEN };
        let mut response = status.into_response();
        if allowed {
            apply_cors_headers(response.headers_mut(), origin.as_deref());
        }
        return response;
    }

    let mut response = next.run(req).await;
    if allowed {
        apply_cors_headers(response.headers_mut(), origin.as_deref());
    }
    response
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap, origin: Option<&str>) {
    let origin_value = origin.and_then(|o| HeaderValue::from_str(o).ok()).unwrap_or_else(|| HeaderValue::from_static("*"));
    headers.insert(HeaderName::from_static(ACCESS_CONTROL_ALLOW_ORIGIN), origin_value);
    headers.insert(HeaderName::from_static(ACCESS_CONTROL_ALLOW_METHODS), HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"));
    headers.insert(HeaderName::from_static(ACCESS_CONTROL_ALLOW_HEADERS), HeaderValue::from_static("*"));
}

/// Drops any header name from a user-configured allow/deny list that is
/// always blocked (spec §4.K "Security-header guard"). Matching is
/// case-insensitive and whitespace-trimmed; this never removes the header
/// from the live request, only from what a governance plugin is permitted
/// to configure.
pub fn sanitize_header_filter_list(configured: &[String]) -> Vec<String> {
    configured
        .iter()
        .filter(|name| {
            let blocked = is_always_blocked_header(name);
            if blocked {
                warn!(header = %name, "ignoring always-blocked header in user-configured filter list");
            }
            !blocked
        })
        .cloned()
        .collect()
}
