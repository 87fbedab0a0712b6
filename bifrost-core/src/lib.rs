mod context;
mod dispatcher;
mod hooks;
mod relay;

pub use context::BifrostContext;
pub use dispatcher::Dispatcher;
pub use dispatcher::ProviderAdapter;
pub use dispatcher::StreamingProviderAdapter;
pub use hooks::HookRunner;
pub use hooks::PostHookRunner;
pub use hooks::Plugin;
pub use hooks::PreHookOutcome;
pub use relay::ChunkSink;
pub use relay::ClientChannel;
pub use relay::HttpBridgeFallback;
pub use relay::RelayMode;
pub use relay::StreamConverter;
pub use relay::UpstreamChannel;
pub use relay::WebSocketCapableProvider;
pub use relay::choose_relay_mode;
pub use relay::decode_sse_stream;
pub use relay::relay_sse;
pub use relay::relay_ws_event;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bifrost_protocol::BifrostError;
    use bifrost_protocol::ConcurrencyConfig;
    use bifrost_protocol::ErrorKind;
    use bifrost_protocol::Key;
    use bifrost_protocol::NetworkConfig;
    use bifrost_protocol::NormalizedRequest;
    use bifrost_protocol::ProviderConfig;
    use bifrost_protocol::RequestKind;
    use http::HeaderMap;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;

    fn ctx() -> BifrostContext {
        BifrostContext::from_headers(&HeaderMap::new(), "trace-1", true)
    }

    fn network() -> NetworkConfig {
        NetworkConfig {
            request_timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_backoff_initial: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(5),
        }
    }

    fn provider(name: &str, keys: Vec<Key>, drop_excess: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_provider_type: None,
            keys,
            network: network(),
            concurrency: ConcurrencyConfig { limit: 4, buffer: 4, drop_excess_requests: drop_excess },
            proxy: None,
            base_url: None,
        }
    }

    fn key(id: &str) -> Key {
        Key { id: id.to_string(), value: format!("secret-{id}"), models: Vec::new(), weight: 1.0, provider_config: serde_json::Value::Null }
    }

    fn req(provider: &str) -> NormalizedRequest {
        NormalizedRequest::new(provider, "gpt-4", RequestKind::ChatCompletion, serde_json::json!({"q": 1}))
    }

    struct ScriptedAdapter {
        calls: AtomicUsize,
        fail_times: usize,
        err_kind: ErrorKind,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn call(&self, key: &Key, _req: &NormalizedRequest, _ctx: &BifrostContext) -> Result<serde_json::Value, BifrostError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(BifrostError::new(self.err_kind, "synthetic failure"));
            }
            Ok(serde_json::json!({"served_by": key.id}))
        }
    }

    #[tokio::test]
    async fn dispatch_succeeds_on_first_attempt() {
        let adapter = ScriptedAdapter { calls: AtomicUsize::new(0), fail_times: 0, err_kind: ErrorKind::Upstream };
        let dispatcher = Dispatcher::new(adapter, vec![provider("openai", vec![key("a")], false)], HookRunner::new(vec![]));
        let result = dispatcher.dispatch(&ctx(), req("openai")).await.unwrap();
        assert_eq!(result["served_by"], "a");
    }

    #[tokio::test]
    async fn dispatch_retries_retryable_errors_before_succeeding() {
        let adapter = ScriptedAdapter { calls: AtomicUsize::new(0), fail_times: 1, err_kind: ErrorKind::Upstream };
        let dispatcher = Dispatcher::new(adapter, vec![provider("openai", vec![key("a")], false)], HookRunner::new(vec![]));
        let ctx = ctx();
        let result = dispatcher.dispatch(&ctx, req("openai")).await.unwrap();
        assert_eq!(result["served_by"], "a");
        assert_eq!(ctx.retry_count(), 1);
    }

    #[tokio::test]
    async fn dispatch_does_not_retry_non_retryable_errors() {
        let adapter = ScriptedAdapter { calls: AtomicUsize::new(0), fail_times: 99, err_kind: ErrorKind::BadRequest };
        let dispatcher = Dispatcher::new(adapter, vec![provider("openai", vec![key("a")], false)], HookRunner::new(vec![]));
        let ctx = ctx();
        let err = dispatcher.dispatch(&ctx, req("openai")).await.unwrap_err();
        assert_matches::assert_matches!(err.kind, ErrorKind::BadRequest);
        assert_eq!(ctx.retry_count(), 0);
    }

    struct FallbackAdapter;
    #[async_trait]
    impl ProviderAdapter for FallbackAdapter {
        async fn call(&self, key: &Key, req: &NormalizedRequest, _ctx: &BifrostContext) -> Result<serde_json::Value, BifrostError> {
            if req.provider == "primary" {
                return Err(BifrostError::new(ErrorKind::Upstream, "primary down"));
            }
            Ok(serde_json::json!({"served_by": key.id, "provider": req.provider}))
        }
    }

    #[tokio::test]
    async fn dispatch_falls_back_when_the_primary_provider_is_exhausted() {
        let providers = vec![
            provider("primary", vec![key("p")], false),
            provider("secondary", vec![key("s")], false),
        ];
        let dispatcher = Dispatcher::new(FallbackAdapter, providers, HookRunner::new(vec![]));
        let mut request = req("primary");
        request.fallbacks = vec![bifrost_protocol::Fallback { provider: "secondary".to_string(), model: "gpt-4".to_string() }];
        let result = dispatcher.dispatch(&ctx(), request).await.unwrap();
        assert_eq!(result["provider"], "secondary");
    }

    struct EchoAdapter;
    #[async_trait]
    impl ProviderAdapter for EchoAdapter {
        async fn call(&self, _key: &Key, req: &NormalizedRequest, _ctx: &BifrostContext) -> Result<serde_json::Value, BifrostError> {
            Ok(req.params.clone().unwrap_or(serde_json::Value::Null))
        }
    }

    struct TaggingPlugin;
    #[async_trait]
    impl Plugin for TaggingPlugin {
        fn name(&self) -> &str {
            "tagging"
        }
        async fn pre_hook(
            &self,
            _ctx: &BifrostContext,
            mut req: NormalizedRequest,
        ) -> Result<PreHookOutcome, BifrostError> {
            req.params = Some(serde_json::json!({"tagged": true}));
            Ok(PreHookOutcome::Continue(req))
        }
        async fn post_hook(&self, _ctx: &BifrostContext, mut chunk: bifrost_protocol::StreamChunk) -> Result<bifrost_protocol::StreamChunk, BifrostError> {
            chunk.body["stamped"] = serde_json::json!(true);
            Ok(chunk)
        }
    }

    #[tokio::test]
    async fn pre_hook_mutation_reaches_the_adapter_and_post_hook_reaches_the_response() {
        let dispatcher = Dispatcher::new(
            EchoAdapter,
            vec![provider("openai", vec![key("a")], false)],
            HookRunner::new(vec![Arc::new(TaggingPlugin)]),
        );
        let result = dispatcher.dispatch(&ctx(), req("openai")).await.unwrap();
        assert_eq!(result["tagged"], true);
        assert_eq!(result["stamped"], true);
    }

    struct ShortCircuitPlugin;
    #[async_trait]
    impl Plugin for ShortCircuitPlugin {
        fn name(&self) -> &str {
            "short-circuit"
        }
        async fn pre_hook(
            &self,
            _ctx: &BifrostContext,
            _req: NormalizedRequest,
        ) -> Result<PreHookOutcome, BifrostError> {
            Ok(PreHookOutcome::ShortCircuit(serde_json::json!({"cached": true})))
        }
    }

    struct NeverCalledAdapter;
    #[async_trait]
    impl ProviderAdapter for NeverCalledAdapter {
        async fn call(&self, _key: &Key, _req: &NormalizedRequest, _ctx: &BifrostContext) -> Result<serde_json::Value, BifrostError> {
            panic!("a short-circuited request must never reach the provider adapter");
        }
    }

    #[tokio::test]
    async fn short_circuit_skips_the_provider_entirely() {
        let dispatcher = Dispatcher::new(
            NeverCalledAdapter,
            vec![provider("openai", vec![key("a")], false)],
            HookRunner::new(vec![Arc::new(ShortCircuitPlugin)]),
        );
        let result = dispatcher.dispatch(&ctx(), req("openai")).await.unwrap();
        assert_eq!(result["cached"], true);
    }

    #[tokio::test]
    async fn unknown_provider_is_reported_as_not_found() {
        let dispatcher = Dispatcher::new(EchoAdapter, vec![], HookRunner::new(vec![]));
        let err = dispatcher.dispatch(&ctx(), req("missing")).await.unwrap_err();
        assert_matches::assert_matches!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn in_flight_buffer_full_with_drop_excess_fails_fast() {
        struct SlowAdapter;
        #[async_trait]
        impl ProviderAdapter for SlowAdapter {
            async fn call(&self, _key: &Key, _req: &NormalizedRequest, _ctx: &BifrostContext) -> Result<serde_json::Value, BifrostError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(serde_json::json!({}))
            }
        }
        let mut cfg = provider("openai", vec![key("a")], true);
        cfg.concurrency = ConcurrencyConfig { limit: 1, buffer: 1, drop_excess_requests: true };
        let dispatcher = Arc::new(Dispatcher::new(SlowAdapter, vec![cfg], HookRunner::new(vec![])));

        let d1 = dispatcher.clone();
        let first = tokio::spawn(async move { d1.dispatch(&ctx(), req("openai")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = dispatcher.dispatch(&ctx(), req("openai")).await.unwrap_err();
        assert_matches::assert_matches!(err.kind, ErrorKind::TooLarge);
        first.await.unwrap().unwrap();
    }
}
