use anyhow::{anyhow, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    Json,
};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::index::{build_course_index, CourseIndex, RawLocation};
use crate::SharedState;

/// Lets shared caches serve a stale listing for two minutes while they
/// revalidate, which bounds the rate of upstream tree fetches.
pub const LISTING_CACHE_CONTROL: &str = "s-maxage=120, stale-while-revalidate";

/// GET /api/resources
/// Course -> files mapping for everything under the watched prefix.
pub async fn list_resources(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let index = load_index(&state).await.map_err(|e| {
        warn!("resource listing failed: {:#}", e);
        ApiError::internal("failed to load resource listing")
    })?;

    Ok(([(header::CACHE_CONTROL, LISTING_CACHE_CONTROL)], Json(index)))
}

async fn load_index(state: &SharedState) -> Result<CourseIndex> {
    let cfg = &state.config;

    let head = state
        .host
        .branch_ref(&cfg.listing_branch)
        .await?
        .ok_or_else(|| anyhow!("branch {} not found", cfg.listing_branch))?;

    let tree = state.host.tree(&head.commit_sha).await?;
    if tree.truncated {
        warn!(
            "tree listing for {} was truncated upstream; serving partial index",
            head.commit_sha
        );
    }

    let location = RawLocation {
        raw_url: cfg.raw_url.clone(),
        owner: cfg.owner.clone(),
        repo: cfg.repo.clone(),
        branch: cfg.listing_branch.clone(),
    };
    let index = build_course_index(&tree.entries, &cfg.watched_prefix, &location);

    info!(
        "listing built from {}: {} courses, {} files",
        head.commit_sha,
        index.len(),
        index.values().map(Vec::len).sum::<usize>()
    );

    Ok(index)
}
