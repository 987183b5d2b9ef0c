use anyhow::{anyhow, bail, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    http::Method,
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::github::{BranchRef, FileWrite, NewPullRequest, PullRequest, RepositoryHost};
use crate::SharedState;

/// Primary branch names, tried in order.
const PRIMARY_BRANCH_CANDIDATES: [&str; 2] = ["main", "master"];

// -----------------------------------------------------------------------------
// Wire types
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub file_name: String,
    /// Base64 of the file bytes.
    pub content: String,
    pub course: String,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionResponse {
    pub success: bool,
    pub pr_url: String,
}

// -----------------------------------------------------------------------------
// Handler
// -----------------------------------------------------------------------------

/// ANY /api/upload
/// Commits the submitted file to a fresh branch and opens a draft PR.
pub async fn upload(
    State(state): State<SharedState>,
    method: Method,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ContributionResponse>, ApiError> {
    if method != Method::POST {
        return Err(ApiError::method_not_allowed());
    }
    let body = body?;

    let submission = serde_json::from_slice::<Submission>(&body)
        .map_err(|e| ApiError::internal(format!("invalid submission body: {}", e)))?;

    info!(
        "contribution received: {} for course {}",
        submission.file_name, submission.course
    );

    match contribute(&state.config, state.host.as_ref(), &submission, Utc::now()).await {
        Ok(pr) => {
            info!("pull request #{} opened: {}", pr.number, pr.html_url);
            Ok(Json(ContributionResponse {
                success: true,
                pr_url: pr.html_url,
            }))
        }
        Err(e) => {
            warn!("contribution of {} failed: {:#}", submission.file_name, e);
            Err(e.into())
        }
    }
}

// -----------------------------------------------------------------------------
// Pipeline
// -----------------------------------------------------------------------------

/// Runs the contribution steps in order; the first failure aborts the rest.
///
/// When the branch was created but a later step fails, the branch is deleted
/// (best effort) before the original error is returned.
pub async fn contribute(
    cfg: &ServerConfig,
    host: &dyn RepositoryHost,
    submission: &Submission,
    now: DateTime<Utc>,
) -> Result<PullRequest> {
    if cfg.github_token.is_none() {
        bail!("GITHUB_TOKEN is not configured on the server");
    }

    let content = validate(submission, cfg.max_upload_bytes)?;
    let course = submission.course.trim();
    let file_name = submission.file_name.trim();

    let base = resolve_primary_branch(host).await?;
    info!("using primary branch {} at {}", base.name, base.commit_sha);

    let branch = contribution_branch_name(now);
    host.create_branch(&branch, &base.commit_sha).await?;
    info!("created branch {}", branch);

    let write = FileWrite {
        path: format!("{}{}/{}", cfg.watched_prefix, course, file_name),
        branch: branch.clone(),
        message: format!("feat: contribute material - {} [skip ci]", course),
        content_base64: content,
    };
    let pr = NewPullRequest {
        title: format!("[Contribution] {} - {}", course, submission.category),
        head: branch.clone(),
        base: base.name.clone(),
        body: format!(
            "Submitted from the web:\n- Course: {}\n- Category: {}\n- File: {}",
            course, submission.category, file_name
        ),
        draft: true,
    };

    match publish(host, &write, &pr).await {
        Ok(opened) => Ok(opened),
        Err(e) => {
            match host.delete_branch(&branch).await {
                Ok(()) => info!("removed branch {} after failed contribution", branch),
                Err(cleanup) => warn!("could not remove branch {}: {:#}", branch, cleanup),
            }
            Err(e)
        }
    }
}

async fn publish(
    host: &dyn RepositoryHost,
    write: &FileWrite,
    pr: &NewPullRequest,
) -> Result<PullRequest> {
    host.write_file(write).await?;
    info!("committed {} on {}", write.path, write.branch);
    host.open_pull_request(pr).await
}

/// First candidate branch that exists. Errors other than "not found" abort
/// the lookup.
pub async fn resolve_primary_branch(host: &dyn RepositoryHost) -> Result<BranchRef> {
    for name in PRIMARY_BRANCH_CANDIDATES {
        if let Some(found) = host.branch_ref(name).await? {
            return Ok(found);
        }
    }
    Err(anyhow!(
        "repository has no primary branch (tried {})",
        PRIMARY_BRANCH_CANDIDATES.join(", ")
    ))
}

/// Millisecond timestamps keep concurrent contributions on distinct branches.
pub fn contribution_branch_name(now: DateTime<Utc>) -> String {
    format!("contrib-{}", now.timestamp_millis())
}

/// Checks the submission and returns its content as canonical base64.
fn validate(submission: &Submission, max_bytes: usize) -> Result<String> {
    check_path_component("fileName", &submission.file_name)?;
    check_path_component("course", &submission.course)?;

    let cleaned: String = submission
        .content
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let decoded = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| anyhow!("content is not valid base64: {}", e))?;

    if decoded.len() > max_bytes {
        bail!(
            "file is too large: {} bytes (limit {} bytes)",
            decoded.len(),
            max_bytes
        );
    }

    Ok(cleaned)
}

fn check_path_component(field: &str, value: &str) -> Result<()> {
    let v = value.trim();
    if v.is_empty() {
        bail!("{} is required", field);
    }
    if v == "." || v == ".." || v.contains('/') || v.contains('\\') {
        bail!("{} must be a single path component: {}", field, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::MockRepositoryHost;
    use crate::{router, AppState};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use anyhow::Context;
    use chrono::TimeZone;
    use mockall::Sequence;
    use std::sync::Arc;
    use tower::ServiceExt;

    const PR_URL: &str = "https://github.com/jing-gou/njupt-notes/pull/42";

    fn config() -> ServerConfig {
        ServerConfig {
            github_token: Some("ghp_test".into()),
            ..ServerConfig::default()
        }
    }

    fn submission() -> Submission {
        Submission {
            file_name: "notes.pdf".into(),
            content: STANDARD.encode(b"%PDF-1.4 hello"),
            course: "OS".into(),
            category: "复习笔记".into(),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()
    }

    fn branch(name: &str) -> Option<BranchRef> {
        Some(BranchRef {
            name: name.into(),
            commit_sha: format!("{}-tip", name),
        })
    }

    fn expect_happy_path(host: &mut MockRepositoryHost) {
        host.expect_branch_ref()
            .withf(|b: &str| b == "main")
            .returning(|b: &str| Ok(branch(b)));
        host.expect_create_branch()
            .withf(|name: &str, sha: &str| name.starts_with("contrib-") && sha == "main-tip")
            .times(1)
            .returning(|_, _| Ok(()));
        host.expect_write_file()
            .withf(|w: &FileWrite| {
                w.path == "public/uploads/OS/notes.pdf"
                    && w.branch.starts_with("contrib-")
                    && w.message.ends_with("[skip ci]")
            })
            .times(1)
            .returning(|_| Ok(()));
        host.expect_open_pull_request()
            .withf(|pr: &NewPullRequest| {
                pr.draft && pr.base == "main" && pr.title == "[Contribution] OS - 复习笔记"
            })
            .times(1)
            .returning(|_| {
                Ok(PullRequest {
                    number: 42,
                    html_url: PR_URL.into(),
                })
            });
        host.expect_delete_branch().never();
    }

    fn state(cfg: ServerConfig, host: MockRepositoryHost) -> SharedState {
        Arc::new(AppState {
            config: Arc::new(cfg),
            host: Arc::new(host),
        })
    }

    async fn call(
        state: SharedState,
        method: Method,
        body: String,
    ) -> (StatusCode, serde_json::Value) {
        let res = router(state)
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri("/api/upload")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn valid_submission_returns_pr_url() {
        let mut host = MockRepositoryHost::new();
        expect_happy_path(&mut host);

        let body = serde_json::to_string(&submission()).unwrap();
        let (status, json) = call(state(config(), host), Method::POST, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        let url = json["prUrl"].as_str().unwrap();
        assert!(url.starts_with("https://github.com/jing-gou/njupt-notes/pull/"));
    }

    #[tokio::test]
    async fn get_is_rejected_with_405() {
        let host = MockRepositoryHost::new();
        let (status, json) = call(state(config(), host), Method::GET, String::new()).await;

        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(json["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn missing_token_fails_before_any_upstream_call() {
        let host = MockRepositoryHost::new();
        let body = serde_json::to_string(&submission()).unwrap();

        let (status, json) = call(state(ServerConfig::default(), host), Method::POST, body).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("GITHUB_TOKEN"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_500_envelope() {
        let host = MockRepositoryHost::new();
        let (status, json) =
            call(state(config(), host), Method::POST, "{not json".into()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid submission body"));
    }

    #[tokio::test]
    async fn upstream_failure_reports_the_root_cause() {
        let mut host = MockRepositoryHost::new();
        host.expect_branch_ref()
            .returning(|b: &str| Ok(branch(b)));
        host.expect_create_branch().returning(|_, _| Ok(()));
        host.expect_write_file().returning(|_| {
            Err(anyhow!("error sending request: connection refused"))
                .context("GitHub write file: request failed")
        });
        host.expect_delete_branch().returning(|_| Ok(()));

        let body = serde_json::to_string(&submission()).unwrap();
        let (status, json) = call(state(config(), host), Method::POST, body).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let message = json["error"].as_str().unwrap();
        assert!(message.starts_with("GitHub write file: request failed"));
        assert!(message.contains("connection refused"));
    }

    #[tokio::test]
    async fn oversized_body_gets_a_413_envelope() {
        let cfg = ServerConfig {
            max_upload_bytes: 1024,
            ..config()
        };
        let limit = cfg.body_limit_bytes();
        let host = MockRepositoryHost::new();

        let (status, json) = call(state(cfg, host), Method::POST, "x".repeat(limit + 1)).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(json["error"].as_str().unwrap().contains("length limit"));
    }

    #[tokio::test]
    async fn falls_back_to_master_when_main_is_missing() {
        let mut host = MockRepositoryHost::new();
        let mut seq = Sequence::new();
        host.expect_branch_ref()
            .withf(|b: &str| b == "main")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        host.expect_branch_ref()
            .withf(|b: &str| b == "master")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|b: &str| Ok(branch(b)));

        let found = resolve_primary_branch(&host).await.unwrap();
        assert_eq!(found.name, "master");
        assert_eq!(found.commit_sha, "master-tip");
    }

    #[tokio::test]
    async fn ref_lookup_error_does_not_fall_back() {
        let mut host = MockRepositoryHost::new();
        host.expect_branch_ref()
            .withf(|b: &str| b == "main")
            .times(1)
            .returning(|_| Err(anyhow!("GitHub get ref failed (401): Bad credentials")));

        let err = resolve_primary_branch(&host).await.unwrap_err();
        assert!(err.to_string().contains("Bad credentials"));
    }

    #[tokio::test]
    async fn branch_is_named_after_the_timestamp() {
        let mut host = MockRepositoryHost::new();
        host.expect_branch_ref()
            .returning(|b: &str| Ok(branch(b)));
        host.expect_create_branch()
            .withf(|name: &str, _: &str| name == "contrib-1700000000123")
            .times(1)
            .returning(|_, _| Ok(()));
        host.expect_write_file().returning(|_| Ok(()));
        host.expect_open_pull_request().returning(|_| {
            Ok(PullRequest {
                number: 1,
                html_url: PR_URL.into(),
            })
        });

        contribute(&config(), &host, &submission(), fixed_now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_pull_request_removes_branch_and_reports_original_error() {
        let mut host = MockRepositoryHost::new();
        host.expect_branch_ref()
            .returning(|b: &str| Ok(branch(b)));
        host.expect_create_branch().returning(|_, _| Ok(()));
        host.expect_write_file().returning(|_| Ok(()));
        host.expect_open_pull_request()
            .returning(|_| Err(anyhow!("GitHub create pull request failed (422): Validation Failed")));
        host.expect_delete_branch()
            .withf(|name: &str| name == "contrib-1700000000123")
            .times(1)
            .returning(|_| Ok(()));

        let err = contribute(&config(), &host, &submission(), fixed_now())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "GitHub create pull request failed (422): Validation Failed"
        );
    }

    #[tokio::test]
    async fn cleanup_failure_still_reports_original_error() {
        let mut host = MockRepositoryHost::new();
        host.expect_branch_ref()
            .returning(|b: &str| Ok(branch(b)));
        host.expect_create_branch().returning(|_, _| Ok(()));
        host.expect_write_file()
            .returning(|_| Err(anyhow!("GitHub write file failed (409): conflict")));
        host.expect_open_pull_request().never();
        host.expect_delete_branch()
            .times(1)
            .returning(|_| Err(anyhow!("GitHub delete ref failed (403): forbidden")));

        let err = contribute(&config(), &host, &submission(), fixed_now())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conflict"));
    }

    #[tokio::test]
    async fn branch_creation_failure_skips_cleanup() {
        let mut host = MockRepositoryHost::new();
        host.expect_branch_ref()
            .returning(|b: &str| Ok(branch(b)));
        host.expect_create_branch()
            .returning(|_, _| Err(anyhow!("GitHub create ref failed (422): Reference already exists")));
        host.expect_write_file().never();
        host.expect_delete_branch().never();

        let err = contribute(&config(), &host, &submission(), fixed_now())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Reference already exists"));
    }

    #[test]
    fn validation_rejects_bad_submissions() {
        let limit = 1024;

        let mut s = submission();
        s.course = "  ".into();
        assert!(validate(&s, limit).unwrap_err().to_string().contains("course is required"));

        let mut s = submission();
        s.file_name = "../secrets.txt".into();
        assert!(validate(&s, limit).is_err());

        let mut s = submission();
        s.course = "OS/extra".into();
        assert!(validate(&s, limit).is_err());

        let mut s = submission();
        s.content = "not base64!!".into();
        assert!(validate(&s, limit)
            .unwrap_err()
            .to_string()
            .contains("base64"));

        let mut s = submission();
        s.content = STANDARD.encode(vec![0u8; limit + 1]);
        assert!(validate(&s, limit).unwrap_err().to_string().contains("too large"));
    }

    #[test]
    fn validation_strips_line_breaks_from_content() {
        let mut s = submission();
        let encoded = STANDARD.encode(b"hello world, hello notes");
        s.content = format!("{}\n{}", &encoded[..8], &encoded[8..]);
        assert_eq!(validate(&s, 1024).unwrap(), encoded);
    }
}
