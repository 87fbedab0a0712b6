use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bifrost_client::RetryPolicy;
use bifrost_protocol::BifrostError;
use bifrost_protocol::ErrorKind;
use bifrost_protocol::ExtraFields;
use bifrost_protocol::Key;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::ProviderConfig;
use bifrost_protocol::StreamChunk;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::context::BifrostContext;
use crate::hooks::HookRunner;

/// Provider-specific call, not in scope for this crate (spec §1): callers
/// supply the concrete wire adapter, the dispatcher only needs this seam.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn call(&self, key: &Key, req: &NormalizedRequest, ctx: &BifrostContext) -> Result<serde_json::Value, BifrostError>;
}

/// Streaming counterpart of `ProviderAdapter` (spec §4.I): opens a chunk
/// stream instead of awaiting a single response. A supertrait rather than
/// extra methods on `ProviderAdapter` so non-streaming adapters/tests are
/// unaffected.
#[async_trait]
pub trait StreamingProviderAdapter: ProviderAdapter {
    async fn call_stream(
        &self,
        key: &Key,
        req: &NormalizedRequest,
        ctx: &BifrostContext,
    ) -> Result<BoxStream<'static, Result<StreamChunk, BifrostError>>, BifrostError>;
}

struct ProviderSlot {
    config: ProviderConfig,
    in_flight: Arc<Semaphore>,
}

/// Given a normalised request, selects a key, calls the provider, handles
/// retry/fallback, and runs plugin hooks around the whole attempt (spec
/// §4.H).
pub struct Dispatcher<A: ProviderAdapter> {
    adapter: A,
    providers: HashMap<String, ProviderSlot>,
    hooks: HookRunner,
}

impl<A: ProviderAdapter> Dispatcher<A> {
    pub fn new(adapter: A, providers: Vec<ProviderConfig>, hooks: HookRunner) -> Self {
        let providers = providers
            .into_iter()
            .map(|config| {
                let buffer = config.concurrency.buffer;
                (config.name.clone(), ProviderSlot { config, in_flight: Arc::new(Semaphore::new(buffer)) })
            })
            .collect();
        Self { adapter, providers, hooks }
    }

    pub async fn dispatch(
        &self,
        ctx: &BifrostContext,
        req: NormalizedRequest,
    ) -> Result<serde_json::Value, BifrostError> {
        let (req, post_hooks, short_circuit) = self.hooks.run_pre_hooks(ctx, req).await?;

        let result = match short_circuit {
            Some(response) => Ok(response),
            None => self.attempt_with_fallbacks(ctx, &req).await,
        };

        let extra = bifrost_protocol::ExtraFields {
            provider: req.provider.clone(),
            request_kind: req.kind,
            model_requested: req.model.clone(),
        };
        let response = match result {
            Ok(value) => post_hooks.apply_to_response(ctx, extra, value).await,
            Err(err) => Err(err),
        };

        post_hooks.cleanup(ctx).await;
        ctx.cancel();
        response
    }

    async fn attempt_with_fallbacks(
        &self,
        ctx: &BifrostContext,
        req: &NormalizedRequest,
    ) -> Result<serde_json::Value, BifrostError> {
        let primary_err = match self.attempt_provider(ctx, &req.provider, &req.model, req).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        for fallback in &req.fallbacks {
            match self.attempt_provider(ctx, &fallback.provider, &fallback.model, req).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(provider = %fallback.provider, model = %fallback.model, %err, "fallback attempt failed");
                }
            }
        }

        Err(primary_err)
    }

    async fn attempt_provider(
        &self,
        ctx: &BifrostContext,
        provider: &str,
        model: &str,
        req: &NormalizedRequest,
    ) -> Result<serde_json::Value, BifrostError> {
        let slot = self
            .providers
            .get(provider)
            .ok_or_else(|| BifrostError::not_found(format!("unknown provider `{provider}`")))?;

        let mut keys = slot.config.eligible_keys(model);
        if keys.is_empty() {
            return Err(BifrostError::not_found(format!("no eligible keys for `{provider}`/`{model}`")));
        }
        bifrost_selector::sort(&mut keys, provider, model)
            .map_err(|e| BifrostError::internal(e.to_string()))?;

        let _permit = self.acquire_slot(ctx, slot).await?;

        let policy = RetryPolicy::new(slot.config.network.clone());
        let mut last_err = None;
        for key in &keys {
            match self.attempt_key(ctx, key, req, &policy).await {
                Ok(value) => return Ok(value),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| BifrostError::internal("no keys attempted")))
    }

    async fn acquire_slot<'a>(
        &self,
        ctx: &BifrostContext,
        slot: &'a ProviderSlot,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, BifrostError> {
        if slot.config.concurrency.drop_excess_requests {
            return Arc::clone(&slot.in_flight)
                .try_acquire_owned()
                .map_err(|_| BifrostError::new(ErrorKind::TooLarge, "provider in-flight buffer full, dropping request"));
        }
        tokio::select! {
            permit = Arc::clone(&slot.in_flight).acquire_owned() => {
                permit.map_err(|_| BifrostError::internal("provider semaphore closed"))
            }
            _ = ctx.cancellation().cancelled() => {
                Err(BifrostError::new(ErrorKind::Timeout, "request cancelled while waiting for a provider slot"))
            }
        }
    }

    async fn attempt_key(
        &self,
        ctx: &BifrostContext,
        key: &Key,
        req: &NormalizedRequest,
        policy: &RetryPolicy,
    ) -> Result<serde_json::Value, BifrostError> {
        let mut attempt = 0;
        loop {
            match self.adapter.call(key, req, ctx).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < policy.max_retries() && policy.should_retry(err.kind) => {
                    ctx.increment_retry_count();
                    tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<A: StreamingProviderAdapter> Dispatcher<A> {
    /// Streaming counterpart of `dispatch` (spec §4.H steps 1-5, feeding
    /// each chunk through the post-hook chain individually instead of step
    /// 6's single-response pass — spec §4.I's relay then takes this stream
    /// directly). Key selection, in-flight buffering, pre-hooks, and
    /// retry/fallback all behave identically to `dispatch`; only the
    /// terminal provider call opens a chunk stream instead of awaiting one
    /// value. The in-flight permit is held for the stream's entire
    /// lifetime, not just until the provider call returns.
    pub async fn dispatch_stream<'a>(
        &'a self,
        ctx: &'a BifrostContext,
        req: NormalizedRequest,
    ) -> Result<BoxStream<'a, Result<StreamChunk, BifrostError>>, BifrostError> {
        let (req, post_hooks, short_circuit) = self.hooks.run_pre_hooks(ctx, req).await?;

        if let Some(response) = short_circuit {
            let extra =
                ExtraFields { provider: req.provider.clone(), request_kind: req.kind, model_requested: req.model.clone() };
            let chunk = StreamChunk::new(response, extra).with_type("completed");
            let hooked = post_hooks.run(ctx, chunk).await;
            post_hooks.cleanup(ctx).await;
            ctx.cancel();
            return Ok(Box::pin(futures::stream::iter(std::iter::once(hooked))));
        }

        let (permit, raw) = self.attempt_with_fallbacks_stream(ctx, &req).await?;
        let state = (raw, post_hooks, ctx, permit, false);
        let hooked = futures::stream::unfold(state, move |(mut raw, post_hooks, ctx, permit, done)| async move {
            if done {
                return None;
            }
            match raw.next().await {
                Some(Ok(chunk)) => {
                    let terminal = chunk.is_terminal();
                    match post_hooks.run(ctx, chunk).await {
                        Ok(hooked_chunk) if terminal => {
                            post_hooks.cleanup(ctx).await;
                            ctx.cancel();
                            Some((Ok(hooked_chunk), (raw, post_hooks, ctx, permit, true)))
                        }
                        Ok(hooked_chunk) => Some((Ok(hooked_chunk), (raw, post_hooks, ctx, permit, false))),
                        Err(err) => {
                            post_hooks.cleanup(ctx).await;
                            ctx.cancel();
                            Some((Err(err), (raw, post_hooks, ctx, permit, true)))
                        }
                    }
                }
                Some(Err(err)) => {
                    post_hooks.cleanup(ctx).await;
                    ctx.cancel();
                    Some((Err(err), (raw, post_hooks, ctx, permit, true)))
                }
                None => {
                    post_hooks.cleanup(ctx).await;
                    ctx.cancel();
                    None
                }
            }
        });
        Ok(Box::pin(hooked))
    }

    async fn attempt_with_fallbacks_stream(
        &self,
        ctx: &BifrostContext,
        req: &NormalizedRequest,
    ) -> Result<(OwnedSemaphorePermit, BoxStream<'static, Result<StreamChunk, BifrostError>>), BifrostError> {
        let primary_err = match self.attempt_provider_stream(ctx, &req.provider, &req.model, req).await {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        for fallback in &req.fallbacks {
            match self.attempt_provider_stream(ctx, &fallback.provider, &fallback.model, req).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    warn!(provider = %fallback.provider, model = %fallback.model, %err, "fallback stream attempt failed");
                }
            }
        }

        Err(primary_err)
    }

    async fn attempt_provider_stream(
        &self,
        ctx: &BifrostContext,
        provider: &str,
        model: &str,
        req: &NormalizedRequest,
    ) -> Result<(OwnedSemaphorePermit, BoxStream<'static, Result<StreamChunk, BifrostError>>), BifrostError> {
        let slot = self
            .providers
            .get(provider)
            .ok_or_else(|| BifrostError::not_found(format!("unknown provider `{provider}`")))?;

        let mut keys = slot.config.eligible_keys(model);
        if keys.is_empty() {
            return Err(BifrostError::not_found(format!("no eligible keys for `{provider}`/`{model}`")));
        }
        bifrost_selector::sort(&mut keys, provider, model).map_err(|e| BifrostError::internal(e.to_string()))?;

        let permit = self.acquire_slot(ctx, slot).await?;
        let policy = RetryPolicy::new(slot.config.network.clone());
        let mut last_err = None;
        for key in &keys {
            let mut attempt = 0;
            loop {
                match self.adapter.call_stream(key, req, ctx).await {
                    Ok(stream) => return Ok((permit, stream)),
                    Err(err) if attempt < policy.max_retries() && policy.should_retry(err.kind) => {
                        ctx.increment_retry_count();
                        tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        last_err = Some(err);
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| BifrostError::internal("no keys attempted")))
    }
}
