//! HTTP Server Bootstrap (spec §4.L).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::Router;
use axum::body::Body;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::ws::Message as AxumMessage;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::response::Response;
use bifrost_core::BifrostContext;
use bifrost_core::ChunkSink;
use bifrost_core::Dispatcher;
use bifrost_core::HookRunner;
use bifrost_core::relay_sse;
use bifrost_core::relay_ws_event;
use bifrost_protocol::BifrostError;
use bifrost_protocol::NormalizedRequest;
use bifrost_protocol::RequestKind;
use bifrost_router::RouteDescriptor;
use bifrost_router::RouteOutcome;
use bifrost_router::RouteParams;
use bifrost_router::ShortCircuitResponse;
use bifrost_ws_pool::Pool;
use bifrost_ws_pool::PoolKey;
use bifrost_ws_pool::PoolLimits;
use bifrost_ws_pool::SessionManager;
use bytes::Bytes;
use owo_colors::OwoColorize;
use rand::Rng;
use tokio::net::TcpListener;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::interceptor::AllowAllInterceptor;
use crate::interceptor::TransportInterceptor;
use crate::interceptor::cors_middleware;
use crate::interceptor::governance_middleware;
use crate::provider_adapter::HttpProviderAdapter;
use crate::ws_transport::AxumClientChannel;
use crate::ws_transport::DispatcherHttpBridge;
use crate::ws_transport::TungsteniteConn;
use crate::ws_transport::WsDialer;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Plugins initialised at startup, in this fixed order (spec §4.L); each may
/// fail softly and be skipped with a warning rather than aborting boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPlugin {
    Pricing,
    Telemetry,
    Logging,
    Governance,
    SemanticCache,
}

const BOOT_PLUGIN_ORDER: [BootPlugin; 5] =
    [BootPlugin::Pricing, BootPlugin::Telemetry, BootPlugin::Logging, BootPlugin::Governance, BootPlugin::SemanticCache];

/// Runs each boot plugin's initializer in the fixed order, logging and
/// skipping any that fail rather than aborting startup.
pub fn init_plugins(mut init: impl FnMut(BootPlugin) -> Result<(), String>) {
    for plugin in BOOT_PLUGIN_ORDER {
        if let Err(reason) = init(plugin) {
            warn!(?plugin, %reason, "boot plugin failed to initialize, continuing without it");
        }
    }
}

/// The native-WS relay's pool/session state (spec §4.C, §4.D), built once at
/// startup alongside the dispatcher it shares with the HTTP-bridge fallback.
pub struct WsState {
    pub sessions: SessionManager<TungsteniteConn>,
    pub pool: Pool<TungsteniteConn>,
    pub dialer: WsDialer,
    pub bridge: DispatcherHttpBridge,
    pub hooks: HookRunner,
}

/// Everything a request handler needs: the hot-reloadable config snapshot,
/// the dispatcher every HTTP route and the WS relay call through, the
/// governance seam (Finding §4.K), and the WS relay's pool/session state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<Config>>,
    pub dispatcher: Arc<Dispatcher<HttpProviderAdapter>>,
    pub interceptor: Arc<dyn TransportInterceptor>,
    pub ws: Arc<WsState>,
}

/// Builds the dispatcher and WS relay state from `config.providers` (cold:
/// spec §4.M, see `Config::providers`'s doc comment). No concrete governance
/// or dispatch plugin is wired up yet (spec §1 Non-goal on concrete policy);
/// `AllowAllInterceptor` and an empty `HookRunner` are the seams those plug
/// into.
pub fn build_app_state(config: Arc<ArcSwap<Config>>) -> AppState {
    let snapshot = config.load();
    let base_urls: HashMap<String, String> =
        snapshot.providers.iter().filter_map(|p| p.base_url.clone().map(|url| (p.name.clone(), url))).collect();
    let providers = snapshot.providers.clone();
    let initial_pool_size = snapshot.initial_pool_size;
    drop(snapshot);

    let transport = bifrost_client::ReqwestTransport::new(reqwest::Client::new());
    let adapter = HttpProviderAdapter::new(Arc::new(transport), base_urls);
    let dispatcher = Arc::new(Dispatcher::new(adapter, providers, HookRunner::new(vec![])));

    let ws = Arc::new(WsState {
        sessions: SessionManager::new(initial_pool_size),
        pool: Pool::new(PoolLimits::default()),
        dialer: WsDialer,
        bridge: DispatcherHttpBridge::new(Arc::clone(&dispatcher)),
        hooks: HookRunner::new(vec![]),
    });

    AppState { config, dispatcher, interceptor: Arc::new(AllowAllInterceptor), ws }
}

async fn not_found() -> Response {
    let body = serde_json::json!({
        "error": {"type": "not_found", "code": "not_found", "message": "no route matched"},
        "status_code": 404,
        "is_bifrost_error": true,
    });
    (StatusCode::NOT_FOUND, axum::Json(body)).into_response()
}

async fn metrics() -> Response {
    // Minimal fixed-format counter dump, not a full Prometheus registry
    // (spec §1 Non-goal on exposition format; SPEC_FULL.md ambient-stack note).
    (StatusCode::OK, "# bifrost gateway metrics\n").into_response()
}

fn error_response(route: &RouteDescriptor, err: &BifrostError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json((route.from_error)(err))).into_response()
}

fn short_circuit_response(response: ShortCircuitResponse) -> Response {
    let mut resp = (StatusCode::OK, axum::Json(response.body)).into_response();
    for (name, value) in response.headers.iter() {
        resp.headers_mut().insert(name.clone(), value.clone());
    }
    resp
}

struct MpscSink(tokio::sync::mpsc::Sender<Bytes>);

#[async_trait::async_trait]
impl ChunkSink for MpscSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), std::io::Error> {
        self.0.send(frame).await.map_err(|_| std::io::Error::other("client disconnected"))
    }
}

/// Runs the dispatcher's streaming attempt and `relay_sse` in a detached
/// task, feeding frames back to the response body over a channel so the
/// response headers go out immediately (spec §4.I "SSE").
async fn stream_response(route: RouteDescriptor, state: AppState, ctx: BifrostContext, req: NormalizedRequest) -> Response {
    let Some(make_converter) = route.stream_converter else {
        return error_response(&route, &BifrostError::internal("route has no stream converter"));
    };
    let converter = make_converter();
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    let dispatcher = Arc::clone(&state.dispatcher);

    tokio::spawn(async move {
        match dispatcher.dispatch_stream(&ctx, req).await {
            Ok(stream) => {
                let mut sink = MpscSink(tx);
                let _ = relay_sse(&ctx, stream, converter.as_ref(), &mut sink, SSE_IDLE_TIMEOUT).await;
            }
            Err(err) => {
                let frame = format!("data: {}\n\n", serde_json::json!({"error": err.message}));
                let _ = tx.send(Bytes::from(frame)).await;
            }
        }
    });

    let body_stream =
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|bytes| (Ok::<_, std::io::Error>(bytes), rx)) });

    let mut response = Response::new(Body::from_stream(body_stream));
    let headers = response.headers_mut();
    headers.insert(axum::http::header::CONTENT_TYPE, axum::http::HeaderValue::from_static("text/event-stream"));
    headers.insert(axum::http::header::CACHE_CONTROL, axum::http::HeaderValue::from_static("no-cache"));
    headers.insert(axum::http::header::CONNECTION, axum::http::HeaderValue::from_static("keep-alive"));
    headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, axum::http::HeaderValue::from_static("*"));
    response
}

/// Runs steps 1-6 of §4.J for one request: parse/convert, dispatch (or
/// stream-dispatch), and translate the result back through the route's
/// converters.
async fn handle_route(
    route: RouteDescriptor,
    state: AppState,
    headers: HeaderMap,
    path_params: HashMap<String, String>,
    query_params: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let params = RouteParams { path_params, query_params };
    let outcome = match route.handle(&params, &body) {
        Ok(outcome) => outcome,
        Err(err) => return error_response(&route, &err),
    };

    match outcome {
        RouteOutcome::ShortCircuit(response) => short_circuit_response(response),
        RouteOutcome::Normalized(req) => {
            let trace_id = format!("{:016x}", rand::rng().random::<u64>());
            let direct_keys_enabled = state.config.load().direct_keys_enabled;
            let ctx = BifrostContext::from_headers(&headers, trace_id, direct_keys_enabled);

            if req.stream && route.stream_converter.is_some() {
                stream_response(route, state, ctx, req).await
            } else {
                match state.dispatcher.dispatch(&ctx, req).await {
                    Ok(value) => match (route.from_response)(value) {
                        Ok(body) => (StatusCode::OK, axum::Json(body)).into_response(),
                        Err(err) => error_response(&route, &err),
                    },
                    Err(err) => error_response(&route, &err),
                }
            }
        }
    }
}

/// Builds the router with routes registered in the fixed group order spec
/// §4.L requires (provider, completion, MCP, integration, config, plugins,
/// optional cache/governance/logging/WS, `/metrics`, UI); the UI catch-all
/// must come last since it owns unmatched paths. This crate builds up to
/// the integration group, the native-WS relay endpoint, and `/metrics`; the
/// remaining groups are named extension points with no body (spec §1
/// Non-goals).
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();
    for route in bifrost_router::default_routes() {
        let path = gateway_path(route.path);
        router = router.route(&path, method_router_for(route));
    }

    router = router.route("/v1/responses/stream", axum::routing::get(responses_ws_handler));

    router
        .route("/metrics", axum::routing::get(metrics))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), governance_middleware))
        .layer(middleware::from_fn_with_state(state.config.clone(), cors_middleware))
        .with_state(state)
}

/// Axum uses `:name`/`*name` path syntax; route descriptors use Gemini's own
/// `{model:*}` notation (spec §6), translated here at registration time.
fn gateway_path(path: &str) -> String {
    path.replace("{model:*}", "{*model}")
}

fn method_router_for(route: RouteDescriptor) -> axum::routing::MethodRouter<AppState> {
    use axum::routing::delete;
    use axum::routing::get;
    use axum::routing::post;
    use axum::routing::put;

    let method = route.method.clone();
    let handler = move |State(state): State<AppState>,
                         headers: HeaderMap,
                         Path(path_params): Path<HashMap<String, String>>,
                         Query(query_params): Query<HashMap<String, String>>,
                         body: Bytes| {
        let route = route.clone();
        async move { handle_route(route, state, headers, path_params, query_params, body).await }
    };

    if method == http::Method::GET {
        get(handler)
    } else if method == http::Method::POST {
        post(handler)
    } else if method == http::Method::PUT {
        put(handler)
    } else if method == http::Method::DELETE {
        delete(handler)
    } else {
        get(handler)
    }
}

fn ws_endpoint_for(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}

/// `GET /v1/responses/stream?model=provider/model`: the native-WS relay
/// (spec §4.I). The provider/model pair is pinned for the session's
/// lifetime at connect time, mirroring how a realtime WS handshake
/// negotiates its model once up front rather than per event.
async fn responses_ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(model_field) = query.get("model") else {
        return (StatusCode::BAD_REQUEST, axum::Json(BifrostError::bad_request("missing `model` query parameter").to_canonical_body()))
            .into_response();
    };
    let (provider, model) = match bifrost_router::parse_provider_model(model_field) {
        Ok(pair) => pair,
        Err(err) => return (StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_REQUEST), axum::Json(err.to_canonical_body())).into_response(),
    };

    ws.on_upgrade(move |socket| handle_ws_session(state, socket, headers, provider, model))
}

async fn handle_ws_session(state: AppState, socket: WebSocket, headers: HeaderMap, provider: String, model: String) {
    let client_conn = format!("ws-{:016x}", rand::rng().random::<u64>());
    let Ok(session) = state.ws.sessions.create(client_conn.clone()) else {
        return;
    };

    let base_url = state.config.load().providers.iter().find(|p| p.name == provider).and_then(|p| p.base_url.clone());
    let mut client = AxumClientChannel(socket);
    let Some(base_url) = base_url else {
        let _ = client.0.send(AxumMessage::Close(None)).await;
        state.ws.sessions.remove(&client_conn).await;
        return;
    };
    let pool_key = PoolKey { provider: provider.clone(), key_id: "default".to_string(), endpoint: ws_endpoint_for(&base_url) };

    loop {
        let text = match client.0.recv().await {
            Some(Ok(AxumMessage::Text(text))) => text,
            Some(Ok(AxumMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(_)) => break,
        };

        let Ok(body) = serde_json::from_str::<serde_json::Value>(&text) else {
            warn!("dropping a client ws frame that failed to parse as JSON");
            continue;
        };

        let mut req = NormalizedRequest::new(provider.clone(), model.clone(), RequestKind::Responses, body);
        req.stream = true;

        let trace_id = format!("{:016x}", rand::rng().random::<u64>());
        let direct_keys_enabled = state.config.load().direct_keys_enabled;
        let ctx = BifrostContext::from_headers(&headers, trace_id, direct_keys_enabled);

        let result = relay_ws_event(
            &ctx,
            &state.ws.hooks,
            &session,
            &state.ws.pool,
            &state.ws.dialer,
            &pool_key,
            &http::HeaderMap::new(),
            req,
            &mut client,
            &state.ws.bridge,
        )
        .await;

        if result.is_err() {
            break;
        }
    }

    state.ws.sessions.remove(&client_conn).await;
}

pub async fn serve(addr: SocketAddr, config: Arc<ArcSwap<Config>>) -> anyhow::Result<()> {
    print_banner(addr);
    let state = build_app_state(config);
    let router = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;
    info!("gateway shut down cleanly");
    Ok(())
}

#[allow(clippy::print_stderr)]
fn print_banner(addr: SocketAddr) {
    eprintln!("{}", "bifrost gateway".bold().green());
    eprintln!("  listening on {}", addr.to_string().cyan());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) else { return };
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining in-flight work");
    tokio::time::sleep(Duration::ZERO).await;
}

/// Waits for in-flight client work to drain, logging and proceeding anyway
/// past the grace deadline (spec §4.L "Shutdown").
pub async fn wait_for_drain<F>(drain: F)
where
    F: std::future::Future<Output = ()>,
{
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed with work still in flight, exiting anyway");
    }
}
