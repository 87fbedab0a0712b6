use std::fmt;

use serde::Serialize;

/// Failure taxonomy shared by every layer of the gateway (see spec §7).
///
/// Only `RateLimited`, `Upstream` and `Timeout` are retried by the dispatcher;
/// every other kind is surfaced straight to the integration's error converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    TooLarge,
    RateLimited,
    Upstream,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::TooLarge => 413,
            ErrorKind::RateLimited => 429,
            ErrorKind::Upstream => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether the dispatcher's attempt loop (§4.H step 4) should retry this
    /// kind against the same key before moving to the next key/fallback.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Upstream | ErrorKind::Timeout
        )
    }

    fn type_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::TooLarge => "too_large",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Canonical gateway error. Every crate in this workspace converts its own
/// leaf errors into this before they cross a component boundary, and the
/// integration router's `error_converter` re-shapes it for the external
/// wire format (spec §6 "Error body (canonical)").
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct BifrostError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
}

impl BifrostError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Canonical JSON body from spec §6.
    pub fn to_canonical_body(&self) -> CanonicalErrorBody {
        CanonicalErrorBody {
            error: CanonicalErrorInner {
                error_type: self.kind.type_str().to_string(),
                code: self.code.clone().unwrap_or_else(|| self.kind.type_str().to_string()),
                message: self.message.clone(),
            },
            status_code: self.kind.http_status(),
            is_bifrost_error: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalErrorBody {
    pub error: CanonicalErrorInner,
    pub status_code: u16,
    pub is_bifrost_error: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalErrorInner {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub message: String,
}

impl fmt::Display for CanonicalErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.error.error_type, self.error.code, self.error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_retry() {
        let retryable = [ErrorKind::RateLimited, ErrorKind::Upstream, ErrorKind::Timeout];
        let not_retryable = [
            ErrorKind::BadRequest,
            ErrorKind::Unauthorized,
            ErrorKind::Forbidden,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::TooLarge,
            ErrorKind::Internal,
        ];
        for kind in retryable {
            assert!(kind.is_retryable(), "{kind:?} should retry");
        }
        for kind in not_retryable {
            assert!(!kind.is_retryable(), "{kind:?} should not retry");
        }
    }

    #[test]
    fn canonical_body_matches_wire_shape() {
        let err = BifrostError::new(ErrorKind::RateLimited, "slow down").with_code("rate_limit_exceeded");
        let body = err.to_canonical_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status_code"], 429);
        assert_eq!(json["is_bifrost_error"], true);
        assert_eq!(json["error"]["type"], "rate_limited");
        assert_eq!(json["error"]["code"], "rate_limit_exceeded");
    }
}
