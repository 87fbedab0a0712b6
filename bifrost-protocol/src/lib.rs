//! Shared wire/data-model types for the Bifrost gateway workspace.
//!
//! This crate has no I/O of its own; it exists so `bifrost-client`,
//! `bifrost-core`, `bifrost-router` and `bifrost-gateway` share one
//! definition of a request, a key, a provider config, a stream chunk and the
//! error taxonomy, the same role `codex-protocol` plays for `codex-api` and
//! `codex-app-server`.

pub mod error;
pub mod key;
pub mod provider;
pub mod rate_limits;
pub mod request;
pub mod stream;

pub use error::BifrostError;
pub use error::ErrorKind;
pub use key::Key;
pub use provider::ConcurrencyConfig;
pub use provider::NetworkConfig;
pub use provider::ProviderConfig;
pub use rate_limits::RateLimitSnapshot;
pub use rate_limits::RateLimitWindow;
pub use request::Fallback;
pub use request::NormalizedRequest;
pub use request::RequestKind;
pub use request::parse_model;
pub use request::strip_provider_suffix;
pub use stream::ExtraFields;
pub use stream::StreamChunk;
