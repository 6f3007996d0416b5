mod auth;
mod config;
mod gateway;
#[cfg(feature = "metrics")]
mod metrics;
mod rest;
mod service;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use axum::{
    extract::{MatchedPath, State},
    http::{header::HeaderName, HeaderValue},
    routing::{get, post},
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, Subscriber};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use parley_coord::{CoordinationStore, InMemoryCoordStore, RedisCoordStore};
use parley_core::NotificationEvent;
use parley_storage::{connect, FollowRepository, StoragePool};

use crate::auth::{TokenSigner, TokenVerifier, DEFAULT_TOKEN_TTL_HOURS};
use crate::config::{CliOverrides, LogFormat, ServerConfig};
use crate::gateway::Gateway;
#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::service::MessagingService;

#[derive(Clone)]
struct StorageState {
    status: StorageStatus,
    pool: Option<StoragePool>,
}

#[derive(Clone)]
enum StorageStatus {
    Unconfigured,
    Connected,
    Error(String),
}

impl StorageState {
    fn unconfigured() -> Self {
        Self {
            status: StorageStatus::Unconfigured,
            pool: None,
        }
    }

    fn connected_with_pool(pool: StoragePool) -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: Some(pool),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: StorageStatus::Error(message),
            pool: None,
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            StorageStatus::Unconfigured => ComponentStatus {
                name: "database",
                status: "pending",
                details: Some("database_url not configured".to_string()),
            },
            StorageStatus::Connected => ComponentStatus {
                name: "database",
                status: "configured",
                details: Some("connection established".to_string()),
            },
            StorageStatus::Error(message) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn is_ready(&self) -> bool {
        matches!(self.status, StorageStatus::Connected)
    }

    fn pool(&self) -> Option<StoragePool> {
        self.pool.clone()
    }
}

#[derive(Clone)]
enum CoordStatus {
    /// Redis-backed; required for multi-instance deployments.
    Redis,
    /// Process-local fallback. Fine for one instance, useless for many.
    InMemory,
    /// Redis was configured but unreachable at startup.
    Error(String),
}

#[derive(Clone)]
struct CoordState {
    status: CoordStatus,
}

impl CoordState {
    fn redis() -> Self {
        Self {
            status: CoordStatus::Redis,
        }
    }

    fn in_memory() -> Self {
        Self {
            status: CoordStatus::InMemory,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: CoordStatus::Error(message),
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            CoordStatus::Redis => ComponentStatus {
                name: "coordination",
                status: "configured",
                details: Some("redis connection established".to_string()),
            },
            CoordStatus::InMemory => ComponentStatus {
                name: "coordination",
                status: "configured",
                details: Some("process-local store; single instance only".to_string()),
            },
            CoordStatus::Error(message) => ComponentStatus {
                name: "coordination",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn is_ready(&self) -> bool {
        !matches!(self.status, CoordStatus::Error(_))
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "parley-server", version, about = "Parley messaging gateway")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    redis_url: Option<String>,
    #[arg(long)]
    auth_signing_key: Option<String>,
    #[arg(long = "auth-fallback-verifying-key", action = ArgAction::Append)]
    auth_fallback_verifying_key: Vec<String>,
    #[arg(long)]
    messaging_max_sends_per_window: Option<u64>,
    #[arg(long)]
    messaging_rate_limit_window_secs: Option<u64>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        let fallback_keys = if self.auth_fallback_verifying_key.is_empty() {
            None
        } else {
            Some(self.auth_fallback_verifying_key)
        };
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            redis_url: self.redis_url,
            auth_signing_key: self.auth_signing_key,
            auth_fallback_verifying_keys: fallback_keys,
            max_sends_per_window: self.messaging_max_sends_per_window,
            rate_limit_window_secs: self.messaging_rate_limit_window_secs,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Mint a bearer token for a user with the configured signing key.
    IssueToken(IssueTokenCommand),
    /// Seed a follow edge into the configured database.
    SeedFollow(SeedFollowCommand),
}

#[derive(Args, Debug)]
struct IssueTokenCommand {
    /// User the token authenticates.
    #[arg(long)]
    user_id: Uuid,
    /// Token lifetime in hours.
    #[arg(long)]
    ttl_hours: Option<i64>,
}

#[derive(Args, Debug)]
struct SeedFollowCommand {
    /// Follower side of the edge.
    #[arg(long)]
    follower: Uuid,
    /// Followed side of the edge.
    #[arg(long)]
    following: Uuid,
    /// Also create the reverse edge so the pair can message immediately.
    #[arg(long)]
    mutual: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    let config = Arc::new(config);
    run(config).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::IssueToken(cmd) => issue_token(config, cmd),
        CliCommand::SeedFollow(cmd) => seed_follow(config, cmd).await,
    }
}

fn issue_token(config: &ServerConfig, cmd: IssueTokenCommand) -> Result<()> {
    let signer = TokenSigner::from_config(&config.auth)?;
    if config.auth.signing_key.is_none() {
        eprintln!(
            "warning: no signing key configured; this token only verifies against \
             the ephemeral key {}",
            signer.verifying_key_base64()
        );
    }
    let ttl = chrono::Duration::hours(cmd.ttl_hours.unwrap_or(DEFAULT_TOKEN_TTL_HOURS));
    let token = signer.mint(cmd.user_id, ttl)?;
    println!("{token}");
    Ok(())
}

async fn seed_follow(config: &ServerConfig, cmd: SeedFollowCommand) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed follows"))?;

    let pool = connect(database_url).await?;
    let follows = FollowRepository::new(pool);
    follows.seed_edge(cmd.follower, cmd.following).await?;
    if cmd.mutual {
        follows.seed_edge(cmd.following, cmd.follower).await?;
    }
    println!(
        "seeded follow {} -> {}{}",
        cmd.follower,
        cmd.following,
        if cmd.mutual { " (mutual)" } else { "" }
    );
    Ok(())
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no PARLEY_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected PARLEY_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        redis_url_configured = config.redis_url.is_some(),
        auth_signing_key_configured = config.auth.signing_key.is_some(),
        auth_fallback_verifying_key_count = config.auth.fallback_verifying_keys.len(),
        messaging_max_sends_per_window = config.messaging.max_sends_per_window,
        messaging_rate_limit_window_secs = config.messaging.rate_limit_window_secs,
        messaging_presence_ttl_secs = config.messaging.presence_ttl_secs,
        messaging_typing_ttl_secs = config.messaging.typing_ttl_secs,
        "resolved server configuration"
    );

    let storage = match config.database_url.as_deref() {
        Some(url) => match connect(url).await {
            Ok(pool) => {
                info!("database connection established");
                StorageState::connected_with_pool(pool)
            }
            Err(err) => {
                error!(?err, "failed to establish database connection");
                StorageState::error(err.to_string())
            }
        },
        None => StorageState::unconfigured(),
    };

    let (coord, coord_state): (Arc<dyn CoordinationStore>, CoordState) =
        match config.redis_url.as_deref() {
            Some(url) => match RedisCoordStore::connect(url, config.coord_settings()).await {
                Ok(store) => {
                    info!("redis coordination store connected");
                    (Arc::new(store), CoordState::redis())
                }
                Err(err) => {
                    error!(?err, "failed to connect to redis; falling back to process-local coordination");
                    (
                        Arc::new(InMemoryCoordStore::new(config.coord_settings())),
                        CoordState::error(err.to_string()),
                    )
                }
            },
            None => {
                info!("no redis configured; coordination state is process-local");
                (
                    Arc::new(InMemoryCoordStore::new(config.coord_settings())),
                    CoordState::in_memory(),
                )
            }
        };

    let signer = TokenSigner::from_config(&config.auth)?;
    match (
        config.auth.signing_key.is_some(),
        config.auth.fallback_verifying_keys.is_empty(),
    ) {
        (false, _) => {
            info!(
                verifying_key = %signer.verifying_key_base64(),
                "no auth signing key supplied; generated ephemeral key"
            );
        }
        (true, false) => {
            info!(
                active_verifying_key = %signer.verifying_key_base64(),
                fallback_keys = %config.auth.fallback_verifying_keys.len(),
                "auth signing key configured with rotation fallbacks"
            );
        }
        (true, true) => {
            info!(
                verifying_key = %signer.verifying_key_base64(),
                "auth signing key loaded from configuration"
            );
        }
    }
    let verifier = Arc::new(TokenVerifier::from_config(&signer, &config.auth)?);

    // Hand-off point for the platform's notification pipeline: this core
    // emits typed records, a consumer elsewhere decides the channel.
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::unbounded_channel::<NotificationEvent>();
    tokio::spawn(async move {
        while let Some(event) = notify_rx.recv().await {
            tracing::debug!(?event, "notification event emitted");
        }
    });

    let service = match storage.pool() {
        Some(pool) => {
            MessagingService::new_with_pool(pool, coord.clone(), config.messaging.clone())
        }
        None => {
            info!("no database configured; messaging state is process-local and the follow graph is empty");
            let (service, _follows) =
                MessagingService::new_in_memory(coord.clone(), config.messaging.clone());
            service
        }
    }
    .with_notifications(notify_tx);

    let gateway = Arc::new(Gateway::new(
        service.clone(),
        coord.clone(),
        config.messaging.max_ws_connections,
    ));
    gateway.spawn_fanout_pump();

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut state = AppState::new(
        config.clone(),
        storage,
        coord_state,
        service,
        gateway,
        verifier,
    );
    #[cfg(feature = "metrics")]
    {
        state = state.with_metrics(metrics_ctx.clone());
    }

    #[cfg(feature = "metrics")]
    let metrics_state = state.clone();

    let app = build_app(state);

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            if let Some(bind_addr) = &config.metrics.bind_addr {
                let metrics_addr: SocketAddr = bind_addr
                    .parse()
                    .context("failed to parse metrics bind addr")?;
                tokio::spawn(async move {
                    if let Err(err) = serve_metrics(metrics_addr, metrics_state).await {
                        error!(?err, "metrics server terminated unexpectedly");
                    }
                });
            }
        }
    }

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    config: Arc<ServerConfig>,
    storage: StorageState,
    coord: CoordState,
    service: MessagingService,
    gateway: Arc<Gateway>,
    verifier: Arc<TokenVerifier>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        storage: StorageState,
        coord: CoordState,
        service: MessagingService,
        gateway: Arc<Gateway>,
        verifier: Arc<TokenVerifier>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            storage,
            coord,
            service,
            gateway,
            verifier,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub(crate) fn service(&self) -> &MessagingService {
        &self.service
    }

    pub(crate) fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    pub(crate) fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn record_http_request(&self, route: &str, status: u16) {
        if let Some(metrics) = &self.metrics {
            metrics
                .http_requests_total
                .with_label_values(&[route, &status.to_string()])
                .inc();
        }
    }
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

async fn health(matched_path: MatchedPath, State(state): State<AppState>) -> &'static str {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), 200);
    #[cfg(not(feature = "metrics"))]
    {
        let _ = (state, matched_path);
    }
    "ok"
}

async fn readiness(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<ReadinessResponse> {
    let status = if state.storage.is_ready() && state.coord.is_ready() {
        "ready"
    } else {
        "degraded"
    };
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), 200);
    #[cfg(not(feature = "metrics"))]
    let _ = matched_path;

    Json(ReadinessResponse {
        status,
        uptime_seconds: state.uptime_seconds(),
        components: vec![state.storage.component(), state.coord.component()],
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version(matched_path: MatchedPath, State(state): State<AppState>) -> Json<VersionResponse> {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), 200);
    #[cfg(not(feature = "metrics"))]
    {
        let _ = (state, matched_path);
    }

    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn init_tracing(config: &ServerConfig) {
    // Respect RUST_LOG if set, otherwise default to info for our crates.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parley_server=info,parley=info"));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn build_subscriber(json: bool, env_filter: EnvFilter) -> Box<dyn Subscriber + Send + Sync> {
    build_subscriber_with_writer(json, env_filter, std::io::stdout)
}

fn build_subscriber_with_writer<W>(
    json: bool,
    env_filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        )
    } else {
        Box::new(
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .compact()
                .finish(),
        )
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here =
        state.metrics_enabled() && state.config.metrics.bind_addr.is_none();

    let client_v1_routes = Router::new()
        .route(
            "/messaging/conversations",
            get(rest::list_conversations).post(rest::create_conversation),
        )
        .route(
            "/messaging/conversations/{conversation_id}/messages",
            get(rest::chat_history),
        )
        .route(
            "/messaging/conversations/{conversation_id}/search",
            get(rest::search_messages),
        )
        .route("/messaging/send", post(rest::send_message))
        .route("/messaging/mark-read", post(rest::mark_read))
        .route("/messaging/can-message/{user_id}", get(rest::can_message))
        .route("/messaging/contacts", get(rest::contacts))
        .route("/messaging/unread-count", get(rest::unread_count))
        .route("/messaging/ws", get(gateway::messaging_socket));

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    // Keep legacy paths while exposing the same handlers under a versioned prefix.
    router = router.merge(client_v1_routes.clone());
    router = router.nest("/client/v1", client_v1_routes);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse::new());

    let instrumentation_layers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(SetRequestIdLayer::new(
            request_id_header.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateHeaderLayer::new(request_id_header))
        .layer(trace_layer)
        .into_inner();

    let router = router.layer(instrumentation_layers);

    router.with_state(state)
}

#[derive(Clone, Default)]
struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let method = request.method().clone();
        let uri_path = request.uri().path().to_string();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| uri_path.clone());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .map(|value| value.to_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info_span!(
            "http.request",
            method = %method,
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
struct HttpOnResponse;

impl HttpOnResponse {
    fn new() -> Self {
        Self
    }
}

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse {
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let status = response.status().as_u16();
        let latency_ms = latency.as_millis() as u64;
        span.record("status_code", status);
        span.record("latency_ms", latency_ms);
        tracing::info!(status_code = status, latency_ms, "request completed");
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let Some(metrics) = state.metrics.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("metrics listening on {bind_addr}");
    axum::serve(listener, build_metrics_router(state).into_make_service()).await?;
    Ok(())
}
