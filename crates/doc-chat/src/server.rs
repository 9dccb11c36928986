//! Server startup: builds the collaborators once, injects them into the
//! orchestrator, and serves the HTTP routes.

use axum::{
    error_handling::HandleErrorLayer,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::context_engine::{DocumentExtractor, OrchestratorConfig, SessionOrchestrator};
use crate::error::ChatError;
use crate::memory_db::MemoryDatabase;
use crate::metrics;
use crate::providers::{HttpObjectStore, LLMClient, LocalObjectStore, ObjectStore, OcrClient};
use crate::shared_state::UnifiedAppState;

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    info!("Starting doc-chat server");
    cfg.print_config();
    metrics::init_metrics();

    let database = MemoryDatabase::new(&cfg.database_path)?;
    let state = build_state(cfg.clone(), &database)?;

    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state)).await?;

    Ok(())
}

/// Wire the HTTP collaborators and the database into shared state.
pub fn build_state(cfg: Config, database: &MemoryDatabase) -> anyhow::Result<UnifiedAppState> {
    std::fs::create_dir_all(&cfg.temp_dir)?;

    let objects: Arc<dyn ObjectStore> = match cfg.local_object_root() {
        Some(root) => {
            info!("Using local object store at {}", root.display());
            Arc::new(LocalObjectStore::new(root))
        }
        None => Arc::new(HttpObjectStore::new(cfg.object_store_url.clone())),
    };
    let extractor = DocumentExtractor::new(Arc::new(OcrClient::from_config(&cfg)), cfg.temp_dir.clone(), cfg.ocr_timeout());

    let orchestrator = SessionOrchestrator::new(
        Arc::new(database.sessions.clone()),
        Arc::new(database.usage.clone()),
        Arc::new(LLMClient::from_config(&cfg)),
        objects,
        extractor,
        OrchestratorConfig::from_config(&cfg),
    );

    let verifier = Arc::new(JwtVerifier::new(&cfg.jwt_secret));
    Ok(UnifiedAppState::new(Arc::new(orchestrator), verifier, Arc::new(cfg)))
}

pub fn build_router(state: UnifiedAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static(crate::error::SESSION_ID_HEADER)]);

    // The chat route is bounded by the orchestrator's pre-stream deadline so a
    // timeout there can still report the session id.
    let bounded: Router<UnifiedAppState> = Router::new()
        .route("/sessions", get(crate::api::list_sessions))
        .route("/sessions/:id", get(crate::api::get_session))
        .route("/sessions/:id/analyze", post(crate::api::analyze_session))
        .route("/usage", get(crate::api::get_usage))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .timeout(state.config.request_timeout()),
        );

    Router::new()
        .route("/chat/stream", post(crate::api::send_message))
        .merge(bounded)
        .route("/metrics", get(metrics::get_metrics))
        .route("/healthz", get(|| async { "OK" }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_timeout_error(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        return ChatError::TimedOut("request exceeded REQUEST_TIMEOUT_SECONDS".to_string()).into_response();
    }
    warn!("Unhandled middleware error: {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}
