//! HTTP server: state, routing and startup.

pub mod archives;
pub mod credentials;
pub mod error;
pub mod events;
pub mod pipes;
pub mod registry;
pub mod stats;
pub mod tasks;

use crate::archive::ArchiveStore;
use crate::config::AppConfig;
use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::events::EventHub;
use crate::pipes::PipeStore;
use crate::registry::cache::QueryCache;
use crate::registry::copier::HttpCopierFactory;
use crate::sync::SyncOrchestrator;
use crate::sync::copier::CopierFactory;
use crate::sync::task::TaskStore;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Archive uploads are whole image tarballs.
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub credentials: Arc<CredentialStore>,
    pub archives: Arc<ArchiveStore>,
    pub pipes: Arc<PipeStore>,
    pub queries: Arc<QueryCache>,
    pub hub: EventHub,
}

/// Wire the stores and the orchestrator onto a data directory.
pub fn build_state(config: AppConfig) -> Result<AppState> {
    config.validate()?;
    config.ensure_dirs()?;

    let hub = EventHub::new();
    let credentials = Arc::new(CredentialStore::open(config.credentials_file())?);
    let archives = Arc::new(ArchiveStore::open(
        config.archives_dir(),
        config.archives_index(),
    )?);
    let pipes = Arc::new(PipeStore::open(config.pipes_dir())?);
    let tasks = Arc::new(TaskStore::open(config.tasks_dir())?);
    let factory: Arc<dyn CopierFactory> = Arc::new(HttpCopierFactory::new()?);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        tasks,
        credentials.clone(),
        archives.clone(),
        hub.clone(),
        factory,
    ));

    Ok(AppState {
        config: Arc::new(config),
        orchestrator,
        credentials,
        archives,
        pipes,
        queries: Arc::new(QueryCache::default()),
        hub,
    })
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(stats::health))
        .route("/api/stats", get(stats::stats))
        .route(
            "/api/credentials",
            get(credentials::list).post(credentials::create),
        )
        .route(
            "/api/credentials/{id}",
            axum::routing::put(credentials::update).delete(credentials::remove),
        )
        .route("/api/credentials/{id}/verify", post(credentials::verify))
        .route("/api/registry/repositories", get(registry::repositories))
        .route("/api/registry/tags", get(registry::tags))
        .route("/api/tasks/sync", post(tasks::execute_sync))
        .route("/api/tasks", get(tasks::list))
        .route("/api/tasks/{id}", get(tasks::get))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel))
        .route("/api/tasks/{id}/retry", post(tasks::retry))
        .route("/api/pipes", get(pipes::list).post(pipes::create))
        .route(
            "/api/pipes/{id}",
            get(pipes::get).put(pipes::update).delete(pipes::remove),
        )
        .route("/api/pipes/{id}/versions", get(pipes::versions))
        .route("/api/pipes/{id}/versions/{version}", get(pipes::version))
        .route("/api/pipes/{id}/ops", get(pipes::ops).post(pipes::append_ops))
        .route("/api/archives", get(archives::list).post(archives::upload))
        .route("/api/archives/merge", post(archives::merge))
        .route("/api/archives/{id}", delete(archives::remove))
        .route("/api/events", get(events::subscribe))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until the process is stopped.
pub async fn run(config: AppConfig) -> Result<()> {
    let state = build_state(config)?;

    let recovered = state.orchestrator.recover()?;
    if recovered > 0 {
        tracing::info!("finalized {} task(s) interrupted by the previous run", recovered);
    }

    let listen = state.config.listen.clone();
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!("listening on {}", listen);
    axum::serve(listener, app).await?;
    Ok(())
}
