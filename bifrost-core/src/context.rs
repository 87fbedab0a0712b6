use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use bifrost_protocol::Key;
use bifrost_protocol::RateLimitSnapshot;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;

const VK_HEADER: &str = "x-bf-vk";
const BEARER_HEADER: &str = "authorization";
const API_KEY_HEADER: &str = "x-api-key";
const GOOGLE_KEY_HEADER: &str = "x-goog-api-key";
const EXTRA_HEADER_PREFIX: &str = "x-bf-eh-";
const API_KEY_NAME_HEADER: &str = "x-bf-api-key";
const VK_PREFIX: &str = "sk-bf-";

/// Request-scoped value store and cancellation signal (spec §4.F). Every
/// handler cancels the context in a deferred cleanup on all exit paths,
/// including the streaming exit path.
pub struct BifrostContext {
    pub virtual_key: Option<String>,
    pub direct_key: Option<Key>,
    pub extra_headers: HashMap<String, String>,
    pub api_key_name: Option<String>,
    pub trace_id: String,
    retry_count: AtomicU32,
    stream_end_indicator: std::sync::atomic::AtomicBool,
    video_output_requested: std::sync::atomic::AtomicBool,
    rate_limits: StdMutex<Option<RateLimitSnapshot>>,
    cancel: CancellationToken,
}

impl BifrostContext {
    pub fn from_headers(headers: &HeaderMap, trace_id: impl Into<String>, allow_direct_keys: bool) -> Self {
        let (virtual_key, direct_key) = extract_keys(headers, allow_direct_keys);
        let extra_headers = extract_extra_headers(headers);
        let api_key_name = header_str(headers, API_KEY_NAME_HEADER).map(str::trim).map(str::to_string);

        Self {
            virtual_key,
            direct_key,
            extra_headers,
            api_key_name,
            trace_id: trace_id.into(),
            retry_count: AtomicU32::new(0),
            stream_end_indicator: std::sync::atomic::AtomicBool::new(false),
            video_output_requested: std::sync::atomic::AtomicBool::new(false),
            rate_limits: StdMutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn increment_retry_count(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn mark_stream_ended(&self) {
        self.stream_end_indicator.store(true, Ordering::SeqCst);
    }

    pub fn stream_ended(&self) -> bool {
        self.stream_end_indicator.load(Ordering::SeqCst)
    }

    pub fn request_video_output(&self) {
        self.video_output_requested.store(true, Ordering::SeqCst);
    }

    pub fn video_output_requested(&self) -> bool {
        self.video_output_requested.load(Ordering::SeqCst)
    }

    pub fn set_rate_limits(&self, snapshot: RateLimitSnapshot) {
        *self.rate_limits.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    pub fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        self.rate_limits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Priority order: `x-bf-vk`, `Bearer sk-bf-*`, `x-api-key sk-bf-*`,
/// `x-goog-api-key sk-bf-*` (spec §4.F). A non-vk value from whichever
/// header matched is turned into a synthetic single-key `direct_key`
/// record, only when the gateway config allows it.
fn extract_keys(headers: &HeaderMap, allow_direct_keys: bool) -> (Option<String>, Option<Key>) {
    if let Some(vk) = header_str(headers, VK_HEADER).map(str::trim).filter(|s| !s.is_empty()) {
        return (Some(vk.to_string()), None);
    }

    let bearer = header_str(headers, BEARER_HEADER).and_then(|raw| {
        let raw = raw.trim();
        let lower = raw.to_ascii_lowercase();
        lower.strip_prefix("bearer ").map(|_| raw[7..].trim().to_string())
    });
    let api_key = header_str(headers, API_KEY_HEADER).map(str::trim).map(str::to_string);
    let google_key = header_str(headers, GOOGLE_KEY_HEADER).map(str::trim).map(str::to_string);
    let candidates: Vec<String> = [bearer, api_key, google_key].into_iter().flatten().filter(|c| !c.is_empty()).collect();

    // A vk-prefixed value anywhere in the priority chain wins over a
    // non-vk value from a higher-priority header (spec §4.F).
    for candidate in &candidates {
        if let Some(vk) = candidate.strip_prefix(VK_PREFIX) {
            return (Some(format!("{VK_PREFIX}{vk}")), None);
        }
    }

    if allow_direct_keys
        && let Some(candidate) = candidates.into_iter().next()
    {
        return (None, Some(direct_key_record(candidate)));
    }

    (None, None)
}

fn direct_key_record(value: String) -> Key {
    Key { id: "direct".to_string(), value, models: Vec::new(), weight: 1.0, provider_config: serde_json::Value::Null }
}

fn extract_extra_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut extra = HashMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if let Some(stripped) = lower.strip_prefix(EXTRA_HEADER_PREFIX)
            && let Ok(value) = value.to_str()
        {
            extra.insert(stripped.to_string(), value.to_string());
        }
    }
    extra
}
