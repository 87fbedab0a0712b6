//! Transport and bootstrap layer for the gateway binary: CORS and security
//! headers (§4.K), the hot-reloadable configuration snapshot (§4.M), and the
//! HTTP server bootstrap (§4.L).

mod config;
mod cors;
mod interceptor;
mod provider_adapter;
mod server;
mod ws_transport;

pub use config::Config;
pub use config::ConfigUpdate;
pub use config::McpBindingLevel;
pub use config::McpConfig;
pub use config::RestartRequired;
pub use config::is_always_blocked_header;
pub use cors::is_origin_allowed;
pub use interceptor::cors_middleware;
pub use interceptor::sanitize_header_filter_list;
pub use provider_adapter::HttpProviderAdapter;
pub use server::AppState;
pub use server::BootPlugin;
pub use server::build_app_state;
pub use server::build_router;
pub use server::init_plugins;
pub use server::serve;

/// Installs a `tracing` subscriber writing to stderr with `RUST_LOG`-driven
/// filtering, matching the teacher's app-server bootstrap
/// (`app-server/src/lib.rs`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let stderr_fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(EnvFilter::from_default_env());
    let _ = tracing_subscriber::registry().with(stderr_fmt).try_init();
}
