//! Integration Router (spec §4.J): a declarative route table plus a
//! representative set of integrations (OpenAI, Anthropic, Gemini, LiteLLM),
//! each implementing the same request-parser / request-converter /
//! response-converter / error-converter contract.

mod anthropic;
mod gemini;
mod litellm;
mod openai;
mod responses;
mod route;

pub use route::RouteDescriptor;
pub use route::RouteOutcome;
pub use route::RouteParams;
pub use route::ShortCircuitResponse;
pub use route::parse_provider_model;

pub use anthropic::messages_route;
pub use gemini::generate_content_route;
pub use gemini::strip_batch_cancel_suffix;
pub use gemini::upload_files_route;
pub use litellm::chat_completions_route as litellm_chat_completions_route;
pub use openai::chat_completions_route as openai_chat_completions_route;
pub use responses::responses_route;

/// The table the server bootstrap (§4.L) walks to register routes. Order
/// here is registration order within the integration group; §4.L fixes the
/// group ordering (provider, completion, ..., integration, ...).
pub fn default_routes() -> Vec<RouteDescriptor> {
    vec![
        openai_chat_completions_route(),
        responses_route(),
        messages_route(),
        generate_content_route(),
        upload_files_route(),
        litellm_chat_completions_route(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_routes_cover_every_representative_integration() {
        let routes = default_routes();
        let paths: Vec<&str> = routes.iter().map(|r| r.path).collect();
        assert!(paths.contains(&"/v1/chat/completions"));
        assert!(paths.contains(&"/v1/responses"));
        assert!(paths.contains(&"/anthropic/v1/messages"));
        assert!(paths.contains(&"/genai/v1beta/models/{model:*}"));
        assert!(paths.contains(&"/genai/upload/v1beta/files"));
        assert!(paths.contains(&"/litellm/v1/chat/completions"));
    }
}
