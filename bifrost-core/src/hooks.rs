use std::sync::Arc;

use async_trait::async_trait;
use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::StreamChunk;

use crate::context::BifrostContext;

/// Outcome of running every plugin's pre-hook (spec §4.G). A short-circuit
/// response bypasses the upstream entirely: the caller writes it straight
/// to the client.
pub enum PreHookOutcome {
    Continue(NormalizedRequest),
    ShortCircuit(serde_json::Value),
}

/// One registered plugin. `pre_hook` may mutate the request, error (abort),
/// or short-circuit; `post_hook` runs once per stream chunk and once for a
/// non-stream response.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_hook(&self, ctx: &BifrostContext, req: NormalizedRequest) -> Result<PreHookOutcome, BifrostError> {
        let _ = ctx;
        Ok(PreHookOutcome::Continue(req))
    }

    async fn post_hook(&self, ctx: &BifrostContext, chunk: StreamChunk) -> Result<StreamChunk, BifrostError> {
        let _ = ctx;
        Ok(chunk)
    }

    async fn cleanup(&self, ctx: &BifrostContext) {
        let _ = ctx;
    }
}

/// Exposed to the caller after pre-hooks have run: feeds chunks/responses
/// through each plugin's post-hook in registration order, and defers
/// `cleanup` across all plugins.
pub struct PostHookRunner {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PostHookRunner {
    pub async fn run(&self, ctx: &BifrostContext, mut chunk: StreamChunk) -> Result<StreamChunk, BifrostError> {
        for plugin in &self.plugins {
            chunk = plugin.post_hook(ctx, chunk).await?;
        }
        Ok(chunk)
    }

    /// Wraps a non-stream response body in a `StreamChunk` so the same
    /// post-hook chain that runs over stream chunks also runs over it, then
    /// unwraps the body back out (spec §4.H step 6).
    pub async fn apply_to_response(
        &self,
        ctx: &BifrostContext,
        extra: bifrost_protocol::ExtraFields,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, BifrostError> {
        let chunk = self.run(ctx, StreamChunk::new(body, extra)).await?;
        Ok(chunk.body)
    }

    pub async fn cleanup(&self, ctx: &BifrostContext) {
        for plugin in &self.plugins {
            plugin.cleanup(ctx).await;
        }
    }
}

/// Runs each plugin's pre-hook in order. If any pre-hook short-circuits,
/// subsequent pre-hooks are skipped (spec §4.G).
pub struct HookRunner {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HookRunner {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub async fn run_pre_hooks(
        &self,
        ctx: &BifrostContext,
        mut req: NormalizedRequest,
    ) -> Result<(NormalizedRequest, PostHookRunner, Option<serde_json::Value>), BifrostError> {
        let mut short_circuit = None;
        for plugin in &self.plugins {
            match plugin.pre_hook(ctx, req.clone()).await? {
                PreHookOutcome::Continue(next) => req = next,
                PreHookOutcome::ShortCircuit(response) => {
                    short_circuit = Some(response);
                    break;
                }
            }
        }
        Ok((req, PostHookRunner { plugins: self.plugins.clone() }, short_circuit))
    }
}
