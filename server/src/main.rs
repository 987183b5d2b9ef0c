use axum::{
    extract::DefaultBodyLimit,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod contribution;
mod error;
mod github;
mod index;
mod listing;

use crate::config::ServerConfig;
use crate::github::{GitHubClient, RepositoryHost};

// -----------------------------------------------------------------------------
// Shared state
// -----------------------------------------------------------------------------

/// Per-process state handed to every handler. Nothing in here is mutated
/// after startup; each request talks to the repository host on its own.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub host: Arc<dyn RepositoryHost>,
}

pub type SharedState = Arc<AppState>;

// -----------------------------------------------------------------------------
// Main entry
// -----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("NOTES_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ServerConfig::from_env()?;
    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN is not set; contributions will be rejected");
    }
    info!(
        "serving {}/{} (prefix {}, branch {})",
        config.owner, config.repo, config.watched_prefix, config.listing_branch
    );

    let addr = config.bind;
    let host = Arc::new(GitHubClient::new(&config));
    let state: SharedState = Arc::new(AppState {
        config: Arc::new(config),
        host,
    });

    let app = router(state);

    info!("notes server listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// API routes, plus the built frontend when `NOTES_STATIC_DIR` is set.
pub fn router(state: SharedState) -> Router {
    let body_limit = state.config.body_limit_bytes();
    let static_dir = state.config.static_dir.clone();

    let api = Router::new()
        .route("/api/resources", get(listing::list_resources))
        .route("/api/upload", any(contribution::upload))
        .route("/api/health", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    let app = match static_dir {
        Some(dir) => {
            info!("serving static files from {}", dir.display());
            api.fallback_service(ServeDir::new(dir))
        }
        None => api,
    };

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
