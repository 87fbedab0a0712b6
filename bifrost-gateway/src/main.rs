#![deny(clippy::print_stdout)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bifrost_gateway::Config;
use bifrost_gateway::McpBindingLevel;
use bifrost_gateway::McpConfig;
use bifrost_gateway::init_tracing;
use bifrost_gateway::serve;
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bifrost-gateway", about = "LLM gateway and proxy")]
struct GatewayArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Path to a config file (TOML); falls back to built-in defaults when absent.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = GatewayArgs::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let config = load_config(args.config.as_deref())?;
        serve(args.listen, Arc::new(ArcSwap::from_pointee(config))).await
    })
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    if let Some(path) = path {
        let raw = std::fs::read_to_string(path)?;
        return Ok(toml::from_str(&raw)?);
    }
    Ok(default_config())
}

fn default_config() -> Config {
    use std::time::Duration;
    Config {
        providers: vec![],
        allowed_origins: vec!["http://localhost:3000".to_string()],
        initial_pool_size: 16,
        drop_excess_requests: false,
        max_request_body_size_mb: 25,
        blocked_headers: vec![],
        proxy: None,
        mcp: McpConfig { binding_level: McpBindingLevel::Tool, depth: Duration::from_secs(60), timeout: Duration::from_secs(30) },
        retry_backoff_min: Duration::from_millis(100),
        retry_backoff_max_bound: Duration::from_secs(30),
        governance_enabled: false,
        semantic_cache_enabled: false,
        logging_enabled: true,
        direct_keys_enabled: true,
        fallbacks_enabled: true,
    }
}
