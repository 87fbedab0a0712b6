use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bifrost_protocol::BifrostError;
use bifrost_protocol::ErrorKind;
use bifrost_protocol::ExtraFields;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::StreamChunk;
use bifrost_ws_pool::Dialer;
use bifrost_ws_pool::Pool;
use bifrost_ws_pool::PoolKey;
use bifrost_ws_pool::Session;
use bifrost_ws_pool::UpstreamConn;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::context::BifrostContext;
use crate::hooks::HookRunner;

const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Per-integration decision about how a `StreamChunk` becomes wire bytes
/// (spec §4.I). Converters own the `[DONE]` sentinel decision: some
/// integrations (OpenAI chat) send it, others (Gemini) never do (spec §9).
pub trait StreamConverter: Send + Sync {
    /// `None` silently drops the chunk (spec §4.I step 2, "nil chunk").
    fn convert(&self, chunk: &StreamChunk) -> Option<serde_json::Value>;

    fn emits_done_sentinel(&self) -> bool {
        true
    }
}

/// Destination for relayed frames. A write failure here means the client
/// disconnected; the relay stops without treating it as an error.
#[async_trait]
pub trait ChunkSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), std::io::Error>;
}

/// Feeds a stream of upstream chunks through a converter and into a sink as
/// `data: <json>\n\n` SSE frames (spec §4.I).
///
/// - A chunk that fails to marshal is skipped, not fatal (step 3).
/// - A write failure is treated as client disconnect: the relay returns
///   `Ok(())` having marked the context's stream-end flag (step 5).
/// - No chunk for `idle_timeout` surfaces as `ErrorKind::Timeout` (step 7).
pub async fn relay_sse<S>(
    ctx: &BifrostContext,
    mut chunks: S,
    converter: &dyn StreamConverter,
    sink: &mut dyn ChunkSink,
    idle_timeout: Duration,
) -> Result<(), BifrostError>
where
    S: Stream<Item = Result<StreamChunk, BifrostError>> + Unpin + Send,
{
    loop {
        let next = tokio::time::timeout(idle_timeout, chunks.next())
            .await
            .map_err(|_| BifrostError::new(ErrorKind::Timeout, "stream produced no chunk within the idle timeout"))?;

        let Some(item) = next else {
            break;
        };
        let chunk = item?;
        let terminal = chunk.is_terminal();

        if let Some(value) = converter.convert(&chunk) {
            match serde_json::to_vec(&value) {
                Ok(body) => {
                    let mut frame = Vec::with_capacity(body.len() + 8);
                    frame.extend_from_slice(b"data: ");
                    frame.extend_from_slice(&body);
                    frame.extend_from_slice(b"\n\n");
                    if sink.send(Bytes::from(frame)).await.is_err() {
                        ctx.mark_stream_ended();
                        debug!("client disconnected mid-stream");
                        return Ok(());
                    }
                }
                Err(err) => {
                    warn!(%err, "dropping a stream chunk that failed to marshal");
                }
            }
        }

        if terminal {
            ctx.mark_stream_ended();
            if converter.emits_done_sentinel() {
                let _ = sink.send(Bytes::from_static(SSE_DONE)).await;
            }
            break;
        }
    }
    Ok(())
}

/// Frames a provider's raw SSE byte stream into `StreamChunk`s (spec §4.I):
/// each event's `data` is parsed as JSON and a `type` field, if present,
/// becomes the chunk's terminal-detection discriminant. A literal `[DONE]`
/// sentinel ends the stream without emitting a chunk. Per-provider body
/// shape stays opaque JSON (spec §1 Non-goal); only the generic SSE framing
/// is decoded here.
pub fn decode_sse_stream(
    bytes: bifrost_client::ByteStream,
    extra: ExtraFields,
) -> BoxStream<'static, Result<StreamChunk, BifrostError>> {
    let events = bytes.eventsource();
    let decoded = events.filter_map(move |event| {
        let extra = extra.clone();
        async move {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    return Some(Err(BifrostError::new(ErrorKind::Upstream, format!("malformed SSE event: {err}"))));
                }
            };
            if event.data == "[DONE]" {
                return None;
            }
            let body: Value = match serde_json::from_str(&event.data) {
                Ok(value) => value,
                Err(err) => {
                    return Some(Err(BifrostError::new(ErrorKind::Upstream, format!("non-JSON SSE event data: {err}"))));
                }
            };
            let chunk_type = body.get("type").and_then(Value::as_str).map(str::to_string);
            let mut chunk = StreamChunk::new(body, extra);
            if let Some(chunk_type) = chunk_type {
                chunk = chunk.with_type(chunk_type);
            }
            Some(Ok(chunk))
        }
    });
    Box::pin(decoded)
}

/// Whether a provider exposes a genuine WebSocket surface, as opposed to one
/// bridged from HTTP SSE (spec REDESIGN FLAGS: prefer the native transport
/// when the provider has one, otherwise bridge).
pub trait WebSocketCapableProvider: Send + Sync {
    fn supports_native_ws(&self, model: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    NativeWebSocket,
    HttpBridge,
}

/// Picks the relay transport for one request. The actual frame translation
/// for either mode is integration-specific wire format (spec §1 Non-goal);
/// this only decides which path the caller should take.
pub fn choose_relay_mode(provider: &dyn WebSocketCapableProvider, model: &str) -> RelayMode {
    if provider.supports_native_ws(model) {
        RelayMode::NativeWebSocket
    } else {
        RelayMode::HttpBridge
    }
}

/// Minimal text-frame operations the native-WS relay needs on top of
/// `UpstreamConn` (spec §4.C/§4.I). The concrete handshake and per-provider
/// framing stay out of scope (spec §1); callers supply a concrete type.
#[async_trait]
pub trait UpstreamChannel: UpstreamConn {
    async fn send_text(&self, text: &str) -> Result<(), BifrostError>;
    async fn recv_text(&self) -> Result<Option<String>, BifrostError>;
}

/// The client side of a native-WS relay: one text frame out per chunk (spec
/// §4.I).
#[async_trait]
pub trait ClientChannel: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), std::io::Error>;
}

/// Falls back to the HTTP-bridge relay for one client event when the native
/// upstream can't be dialed or dies mid-stream (spec REDESIGN FLAGS: prefer
/// native WS, bridge on failure). Implemented by the caller, who owns the
/// `Dispatcher`/`relay_sse` wiring for the bridge path.
#[async_trait]
pub trait HttpBridgeFallback: Send + Sync {
    async fn relay_over_http_bridge(
        &self,
        ctx: &BifrostContext,
        req: NormalizedRequest,
        client: &mut dyn ClientChannel,
    ) -> Result<(), BifrostError>;
}

async fn write_chunk(client: &mut dyn ClientChannel, chunk: &StreamChunk) {
    match serde_json::to_string(chunk) {
        Ok(text) => {
            if client.send_text(&text).await.is_err() {
                debug!("client disconnected mid-stream");
            }
        }
        Err(err) => warn!(%err, "dropping a ws chunk that failed to marshal"),
    }
}

/// Relays one client WebSocket event over a session-pinned native upstream
/// (spec §4.I steps 1-7): reuses the session's pinned connection or leases a
/// fresh one from the pool, forwards the event, and streams chunks back
/// through the post-hook chain with terminal detection and
/// `previous_response_id` chaining. A dial failure or mid-stream upstream
/// error discards the connection and hands the event to `bridge` instead.
#[allow(clippy::too_many_arguments)]
pub async fn relay_ws_event<C: UpstreamChannel>(
    ctx: &BifrostContext,
    hooks: &HookRunner,
    session: &Session<C>,
    pool: &Pool<C>,
    dialer: &dyn Dialer<C>,
    pool_key: &PoolKey,
    dial_headers: &http::HeaderMap,
    req: NormalizedRequest,
    client: &mut dyn ClientChannel,
    bridge: &dyn HttpBridgeFallback,
) -> Result<(), BifrostError> {
    let original_req = req.clone();
    let (req, post_hooks, short_circuit) = hooks.run_pre_hooks(ctx, req).await?;

    if let Some(response) = short_circuit {
        let extra = ExtraFields { provider: req.provider.clone(), request_kind: req.kind, model_requested: req.model.clone() };
        let chunk = StreamChunk::new(response, extra).with_type("completed");
        let result = match post_hooks.run(ctx, chunk).await {
            Ok(hooked) => {
                write_chunk(client, &hooked).await;
                Ok(())
            }
            Err(err) => Err(err),
        };
        ctx.mark_stream_ended();
        post_hooks.cleanup(ctx).await;
        ctx.cancel();
        return result;
    }

    let conn = match session.upstream() {
        Some(conn) => conn,
        None => match pool.get(pool_key, dial_headers, dialer).await {
            Ok(conn) => {
                session.pin_upstream(Arc::clone(&conn));
                conn
            }
            Err(err) => {
                warn!(%err, "ws dial failed, falling back to the http bridge");
                post_hooks.cleanup(ctx).await;
                ctx.cancel();
                return bridge.relay_over_http_bridge(ctx, original_req, client).await;
            }
        },
    };

    let event_text =
        serde_json::to_string(&req.input).map_err(|err| BifrostError::internal(format!("failed to marshal client event: {err}")))?;

    if let Err(err) = conn.send_text(&event_text).await {
        warn!(%err, "ws send failed, discarding connection and falling back to the http bridge");
        session.clear_upstream();
        pool.discard(conn).await;
        post_hooks.cleanup(ctx).await;
        ctx.cancel();
        return bridge.relay_over_http_bridge(ctx, original_req, client).await;
    }

    loop {
        match conn.recv_text().await {
            Ok(Some(text)) => {
                let Ok(body) = serde_json::from_str::<Value>(&text) else {
                    warn!("dropping a ws event that failed to parse as JSON");
                    continue;
                };
                let chunk_type = body.get("type").and_then(Value::as_str).map(str::to_string);
                let extra = ExtraFields { provider: req.provider.clone(), request_kind: req.kind, model_requested: req.model.clone() };
                let mut chunk = StreamChunk::new(body, extra);
                if let Some(chunk_type) = chunk_type {
                    chunk = chunk.with_type(chunk_type);
                }
                let terminal = chunk.is_terminal();
                let response_id = chunk.response_id().map(str::to_string);

                match post_hooks.run(ctx, chunk).await {
                    Ok(hooked) => write_chunk(client, &hooked).await,
                    Err(err) => {
                        post_hooks.cleanup(ctx).await;
                        ctx.cancel();
                        return Err(err);
                    }
                }

                if terminal {
                    session.observe_response_id(response_id.as_deref());
                    ctx.mark_stream_ended();
                    post_hooks.cleanup(ctx).await;
                    ctx.cancel();
                    return Ok(());
                }
            }
            Ok(None) => {
                post_hooks.cleanup(ctx).await;
                ctx.cancel();
                return Ok(());
            }
            Err(err) => {
                warn!(%err, "ws read failed mid-stream, discarding connection and falling back to the http bridge");
                session.clear_upstream();
                pool.discard(conn).await;
                post_hooks.cleanup(ctx).await;
                ctx.cancel();
                return bridge.relay_over_http_bridge(ctx, original_req, client).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use bifrost_protocol::ExtraFields;
    use bifrost_protocol::RequestKind;
    use http::HeaderMap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn ctx() -> BifrostContext {
        BifrostContext::from_headers(&HeaderMap::new(), "t", true)
    }

    fn extra() -> ExtraFields {
        ExtraFields { provider: "openai".to_string(), request_kind: RequestKind::ChatCompletion, model_requested: "gpt-4".to_string() }
    }

    fn chunk(body: serde_json::Value, chunk_type: Option<&str>) -> StreamChunk {
        let c = StreamChunk::new(body, extra());
        match chunk_type {
            Some(t) => c.with_type(t),
            None => c,
        }
    }

    struct PassThrough;
    impl StreamConverter for PassThrough {
        fn convert(&self, chunk: &StreamChunk) -> Option<serde_json::Value> {
            Some(chunk.body.clone())
        }
    }

    struct NoDoneConverter;
    impl StreamConverter for NoDoneConverter {
        fn convert(&self, chunk: &StreamChunk) -> Option<serde_json::Value> {
            Some(chunk.body.clone())
        }
        fn emits_done_sentinel(&self) -> bool {
            false
        }
    }

    struct DropEverything;
    impl StreamConverter for DropEverything {
        fn convert(&self, _chunk: &StreamChunk) -> Option<serde_json::Value> {
            None
        }
    }

    #[derive(Default, Clone)]
    struct RecordingSink(Arc<Mutex<Vec<Bytes>>>);
    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn send(&mut self, frame: Bytes) -> Result<(), std::io::Error> {
            self.0.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct DisconnectingSink;
    #[async_trait]
    impl ChunkSink for DisconnectingSink {
        async fn send(&mut self, _frame: Bytes) -> Result<(), std::io::Error> {
            Err(std::io::Error::other("client gone"))
        }
    }

    fn stream_of(chunks: Vec<StreamChunk>) -> impl Stream<Item = Result<StreamChunk, BifrostError>> + Unpin + Send {
        futures::stream::iter(chunks.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn emits_sse_frames_and_done_sentinel_on_terminal_chunk() {
        let ctx = ctx();
        let chunks = stream_of(vec![
            chunk(serde_json::json!({"delta": "a"}), None),
            chunk(serde_json::json!({"delta": "b"}), Some("completed")),
        ]);
        let mut sink = RecordingSink::default();
        relay_sse(&ctx, chunks, &PassThrough, &mut sink, Duration::from_secs(5)).await.unwrap();

        let frames = sink.0.lock().unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].starts_with(b"data: "));
        assert_eq!(&frames[2][..], SSE_DONE);
        assert!(ctx.stream_ended());
    }

    #[tokio::test]
    async fn converter_can_opt_out_of_the_done_sentinel() {
        let ctx = ctx();
        let chunks = stream_of(vec![chunk(serde_json::json!({}), Some("completed"))]);
        let mut sink = RecordingSink::default();
        relay_sse(&ctx, chunks, &NoDoneConverter, &mut sink, Duration::from_secs(5)).await.unwrap();
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nil_chunks_are_silently_dropped() {
        let ctx = ctx();
        let chunks = stream_of(vec![
            chunk(serde_json::json!({"delta": "a"}), None),
            chunk(serde_json::json!({}), Some("completed")),
        ]);
        let mut sink = RecordingSink::default();
        relay_sse(&ctx, chunks, &DropEverything, &mut sink, Duration::from_secs(5)).await.unwrap();
        // the converter drops every body but the terminal chunk still ends the stream and emits [DONE]
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert_eq!(&sink.0.lock().unwrap()[0][..], SSE_DONE);
    }

    #[tokio::test]
    async fn write_failure_ends_the_relay_without_an_error() {
        let ctx = ctx();
        let chunks = stream_of(vec![
            chunk(serde_json::json!({"delta": "a"}), None),
            chunk(serde_json::json!({"delta": "b"}), Some("completed")),
        ]);
        let mut sink = DisconnectingSink;
        let result = relay_sse(&ctx, chunks, &PassThrough, &mut sink, Duration::from_secs(5)).await;
        assert!(result.is_ok());
        assert!(ctx.stream_ended());
    }

    #[tokio::test]
    async fn idle_timeout_surfaces_as_a_timeout_error() {
        let ctx = ctx();
        let chunks = futures::stream::pending::<Result<StreamChunk, BifrostError>>();
        let mut sink = RecordingSink::default();
        let result = relay_sse(&ctx, chunks, &PassThrough, &mut sink, Duration::from_millis(10)).await;
        assert_matches::assert_matches!(result.unwrap_err().kind, ErrorKind::Timeout);
    }

    struct AlwaysNative;
    impl WebSocketCapableProvider for AlwaysNative {
        fn supports_native_ws(&self, _model: &str) -> bool {
            true
        }
    }

    struct NeverNative;
    impl WebSocketCapableProvider for NeverNative {
        fn supports_native_ws(&self, _model: &str) -> bool {
            false
        }
    }

    #[test]
    fn relay_mode_follows_provider_capability() {
        assert_eq!(choose_relay_mode(&AlwaysNative, "gpt-4"), RelayMode::NativeWebSocket);
        assert_eq!(choose_relay_mode(&NeverNative, "gpt-4"), RelayMode::HttpBridge);
    }

    fn byte_stream(raw: &'static [u8]) -> bifrost_client::ByteStream {
        Box::pin(futures::stream::once(async move { Ok(Bytes::from_static(raw)) }))
    }

    #[tokio::test]
    async fn decode_sse_stream_parses_events_and_stops_at_the_done_sentinel() {
        let raw = b"data: {\"type\":\"delta\",\"text\":\"hi\"}\n\ndata: {\"type\":\"completed\"}\n\ndata: [DONE]\n\n";
        let mut chunks = decode_sse_stream(byte_stream(raw), extra());

        let first = chunks.next().await.unwrap().unwrap();
        assert_eq!(first.body["text"], "hi");
        assert!(!first.is_terminal());

        let second = chunks.next().await.unwrap().unwrap();
        assert!(second.is_terminal());

        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn decode_sse_stream_surfaces_non_json_data_as_an_upstream_error() {
        let raw = b"data: not json\n\n";
        let mut chunks = decode_sse_stream(byte_stream(raw), extra());
        let err = chunks.next().await.unwrap().unwrap_err();
        assert_matches::assert_matches!(err.kind, ErrorKind::Upstream);
    }

    struct FakeUpstream {
        closed: std::sync::atomic::AtomicBool,
        inbox: Mutex<Vec<String>>,
        outbox: Mutex<std::collections::VecDeque<String>>,
    }

    impl FakeUpstream {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                closed: std::sync::atomic::AtomicBool::new(false),
                inbox: Mutex::new(Vec::new()),
                outbox: Mutex::new(replies.into_iter().map(str::to_string).collect()),
            }
        }
    }

    #[async_trait]
    impl UpstreamConn for FakeUpstream {
        fn is_closed(&self) -> bool {
            self.closed.load(std::sync::atomic::Ordering::SeqCst)
        }
        async fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl UpstreamChannel for FakeUpstream {
        async fn send_text(&self, text: &str) -> Result<(), BifrostError> {
            self.inbox.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn recv_text(&self) -> Result<Option<String>, BifrostError> {
            Ok(self.outbox.lock().unwrap().pop_front())
        }
    }

    struct FailingDialer;
    #[async_trait]
    impl Dialer<FakeUpstream> for FailingDialer {
        async fn dial(&self, key: &PoolKey, _headers: &http::HeaderMap) -> Result<FakeUpstream, bifrost_ws_pool::PoolError> {
            Err(bifrost_ws_pool::PoolError::DialFailed { endpoint: key.endpoint.clone(), message: "no route to host".to_string() })
        }
    }

    struct PrePinnedDialer;
    #[async_trait]
    impl Dialer<FakeUpstream> for PrePinnedDialer {
        async fn dial(&self, _key: &PoolKey, _headers: &http::HeaderMap) -> Result<FakeUpstream, bifrost_ws_pool::PoolError> {
            panic!("a session with a pinned upstream must not dial again")
        }
    }

    #[derive(Default)]
    struct RecordingClient(Vec<String>);
    #[async_trait]
    impl ClientChannel for RecordingClient {
        async fn send_text(&mut self, text: &str) -> Result<(), std::io::Error> {
            self.0.push(text.to_string());
            Ok(())
        }
    }

    struct RecordingBridge(std::sync::atomic::AtomicBool);
    #[async_trait]
    impl HttpBridgeFallback for RecordingBridge {
        async fn relay_over_http_bridge(
            &self,
            _ctx: &BifrostContext,
            _req: NormalizedRequest,
            _client: &mut dyn ClientChannel,
        ) -> Result<(), BifrostError> {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn ws_req() -> NormalizedRequest {
        NormalizedRequest::new("openai", "gpt-4o-realtime", bifrost_protocol::RequestKind::Responses, serde_json::json!({"q": 1}))
    }

    fn pool_key() -> PoolKey {
        PoolKey { provider: "openai".into(), key_id: "k1".into(), endpoint: "wss://api.openai.com".into() }
    }

    #[tokio::test]
    async fn relay_ws_event_streams_chunks_and_captures_the_terminal_response_id() {
        let replies = vec![
            r#"{"type":"in_progress","id":"resp_1"}"#,
            r#"{"type":"completed","id":"resp_1"}"#,
        ];
        let pool: Pool<FakeUpstream> = Pool::new(bifrost_ws_pool::PoolLimits::default());
        let dialer = PrePinnedDialer;
        let manager: bifrost_ws_pool::SessionManager<FakeUpstream> = bifrost_ws_pool::SessionManager::new(4);
        let session = manager.create("client-1").unwrap();
        session.pin_upstream(Arc::new(FakeUpstream::new(replies)));

        let ctx = ctx();
        let hooks = HookRunner::new(vec![]);
        let mut client = RecordingClient::default();
        let bridge = RecordingBridge(std::sync::atomic::AtomicBool::new(false));

        relay_ws_event(&ctx, &hooks, &session, &pool, &dialer, &pool_key(), &http::HeaderMap::new(), ws_req(), &mut client, &bridge)
            .await
            .unwrap();

        assert_eq!(client.0.len(), 2);
        assert!(ctx.stream_ended());
        assert_eq!(session.last_response_id().as_deref(), Some("resp_1"));
        assert!(!bridge.0.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn relay_ws_event_falls_back_to_the_http_bridge_when_the_dial_fails() {
        let pool: Pool<FakeUpstream> = Pool::new(bifrost_ws_pool::PoolLimits::default());
        let dialer = FailingDialer;
        let manager: bifrost_ws_pool::SessionManager<FakeUpstream> = bifrost_ws_pool::SessionManager::new(4);
        let session = manager.create("client-1").unwrap();

        let ctx = ctx();
        let hooks = HookRunner::new(vec![]);
        let mut client = RecordingClient::default();
        let bridge = RecordingBridge(std::sync::atomic::AtomicBool::new(false));

        relay_ws_event(&ctx, &hooks, &session, &pool, &dialer, &pool_key(), &http::HeaderMap::new(), ws_req(), &mut client, &bridge)
            .await
            .unwrap();

        assert!(bridge.0.load(std::sync::atomic::Ordering::SeqCst));
        assert!(client.0.is_empty());
    }
}
