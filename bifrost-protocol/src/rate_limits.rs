use http::HeaderMap;
use serde::Serialize;

/// One rate-limit window (used/primary/secondary), parsed from provider
/// response headers. Ambient telemetry grounded on the teacher's
/// `codex-api::rate_limits` header family, generalised to a provider-neutral
/// `x-bf-ratelimit-*` prefix since concrete provider header names are out of
/// scope (spec §1).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitWindow {
    pub used_percent: f64,
    pub window_minutes: Option<i64>,
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitSnapshot {
    pub primary: Option<RateLimitWindow>,
    pub secondary: Option<RateLimitWindow>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }
}

fn parse_window(headers: &HeaderMap, used: &str, window: &str, reset: &str) -> Option<RateLimitWindow> {
    let used_percent = headers.get(used)?.to_str().ok()?.parse::<f64>().ok()?;
    let window_minutes = headers.get(window).and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok());
    let reset_at = headers.get(reset).and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok());
    Some(RateLimitWindow { used_percent, window_minutes, reset_at })
}

/// Parses the `x-bf-ratelimit-{primary,secondary}-*` header family into a
/// snapshot the dispatcher attaches to the `BifrostContext` for plugins/
/// logging to observe (spec §9 "ambient" enrichment — see SPEC_FULL.md).
pub fn parse_rate_limits(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let snapshot = RateLimitSnapshot {
        primary: parse_window(
            headers,
            "x-bf-ratelimit-primary-used-percent",
            "x-bf-ratelimit-primary-window-minutes",
            "x-bf-ratelimit-primary-reset-at",
        ),
        secondary: parse_window(
            headers,
            "x-bf-ratelimit-secondary-used-percent",
            "x-bf-ratelimit-secondary-window-minutes",
            "x-bf-ratelimit-secondary-reset-at",
        ),
    };
    (!snapshot.is_empty()).then_some(snapshot)
}
