use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServerConfig;

// -----------------------------------------------------------------------------
// Types
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
    /// Submodule pointer.
    Commit,
}

/// One entry of a recursive tree listing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RepositoryBlob {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    pub sha: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RepositoryTree {
    #[serde(rename = "tree")]
    pub entries: Vec<RepositoryBlob>,
    #[serde(default)]
    pub truncated: bool,
}

/// A branch reference resolved to the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub name: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub path: String,
    pub branch: String,
    pub message: String,
    /// Standard base64 of the file bytes.
    pub content_base64: String,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
    pub draft: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

// -----------------------------------------------------------------------------
// Hosting provider seam
// -----------------------------------------------------------------------------

/// The operations the service needs from the repository host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryHost: Send + Sync {
    /// Resolves `heads/<branch>`. `Ok(None)` when the branch does not exist.
    async fn branch_ref(&self, branch: &str) -> Result<Option<BranchRef>>;

    /// Recursive tree for a commit or tree sha.
    async fn tree(&self, sha: &str) -> Result<RepositoryTree>;

    async fn create_branch(&self, name: &str, commit_sha: &str) -> Result<()>;

    async fn delete_branch(&self, name: &str) -> Result<()>;

    /// Creates or overwrites a file on a branch.
    async fn write_file(&self, write: &FileWrite) -> Result<()>;

    async fn open_pull_request(&self, pr: &NewPullRequest) -> Result<PullRequest>;
}

// -----------------------------------------------------------------------------
// GitHub REST implementation
// -----------------------------------------------------------------------------

const USER_AGENT: &str = concat!("notes-server/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitHubErrorBody {
    message: String,
}

#[derive(Debug, Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    reference: String,
    sha: &'a str,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: &'a str,
    branch: &'a str,
    /// Blob being replaced; GitHub rejects the write without it when the
    /// path already exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_url: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GitHubClient {
    pub fn new(cfg: &ServerConfig) -> Self {
        GitHubClient {
            client: Client::new(),
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            owner: cfg.owner.clone(),
            repo: cfg.repo.clone(),
            token: cfg.github_token.clone(),
        }
    }

    /// `{api}/repos/{owner}/{repo}/<segments...>`, each segment percent-encoded.
    fn repo_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = Url::parse(&self.api_url)
            .with_context(|| format!("invalid GitHub API url {}", self.api_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("GitHub API url cannot be a base: {}", self.api_url))?
            .pop_if_empty()
            .extend(["repos", self.owner.as_str(), self.repo.as_str()])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header(header::USER_AGENT, USER_AGENT)
            .header("X-GitHub-Api-Version", "2022-11-28");

        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, op: &str, builder: RequestBuilder) -> Result<reqwest::Response> {
        self.send_optional(op, builder)
            .await?
            .ok_or_else(|| anyhow!("GitHub {} failed (404): Not Found", op))
    }

    /// Like `send`, but a 404 comes back as `Ok(None)`.
    async fn send_optional(
        &self,
        op: &str,
        builder: RequestBuilder,
    ) -> Result<Option<reqwest::Response>> {
        let res = builder
            .send()
            .await
            .with_context(|| format!("GitHub {}: request failed", op))?;

        let status = res.status();
        debug!("GitHub {} -> {}", op, status);

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(res));
        }

        Err(upstream_error(op, status, res.text().await.unwrap_or_default()))
    }

    /// Blob sha currently stored at `path` on `branch`, if the file exists.
    async fn existing_file_sha(&self, path: &str, branch: &str) -> Result<Option<String>> {
        let mut url = self.repo_url(["contents"].into_iter().chain(path.split('/')))?;
        url.query_pairs_mut().append_pair("ref", branch);

        match self
            .send_optional("get file", self.request(Method::GET, url))
            .await?
        {
            Some(res) => Ok(Some(res.json::<ContentsResponse>().await?.sha)),
            None => Ok(None),
        }
    }
}

/// Builds an error from a non-success response, preferring the provider's own
/// `message` field.
fn upstream_error(op: &str, status: StatusCode, body: String) -> anyhow::Error {
    let message = serde_json::from_str::<GitHubErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or(body);
    anyhow!("GitHub {} failed ({}): {}", op, status.as_u16(), message)
}

#[async_trait]
impl RepositoryHost for GitHubClient {
    async fn branch_ref(&self, branch: &str) -> Result<Option<BranchRef>> {
        let url = self.repo_url(["git", "ref", "heads", branch])?;
        let Some(res) = self
            .send_optional("get ref", self.request(Method::GET, url))
            .await?
        else {
            return Ok(None);
        };

        let body = res.json::<RefResponse>().await?;
        Ok(Some(BranchRef {
            name: branch.to_string(),
            commit_sha: body.object.sha,
        }))
    }

    async fn tree(&self, sha: &str) -> Result<RepositoryTree> {
        let mut url = self.repo_url(["git", "trees", sha])?;
        url.query_pairs_mut().append_pair("recursive", "1");

        let res = self.send("get tree", self.request(Method::GET, url)).await?;
        Ok(res.json::<RepositoryTree>().await?)
    }

    async fn create_branch(&self, name: &str, commit_sha: &str) -> Result<()> {
        let url = self.repo_url(["git", "refs"])?;
        let req = CreateRefRequest {
            reference: format!("refs/heads/{}", name),
            sha: commit_sha,
        };
        self.send("create ref", self.request(Method::POST, url).json(&req))
            .await?;
        Ok(())
    }

    async fn delete_branch(&self, name: &str) -> Result<()> {
        let url = self.repo_url(["git", "refs", "heads", name])?;
        self.send("delete ref", self.request(Method::DELETE, url))
            .await?;
        Ok(())
    }

    async fn write_file(&self, write: &FileWrite) -> Result<()> {
        let existing = self
            .existing_file_sha(&write.path, &write.branch)
            .await?;
        if existing.is_some() {
            debug!("overwriting {} on {}", write.path, write.branch);
        }

        let url = self.repo_url(["contents"].into_iter().chain(write.path.split('/')))?;
        let req = PutContentsRequest {
            message: &write.message,
            content: &write.content_base64,
            branch: &write.branch,
            sha: existing.as_deref(),
        };
        self.send("write file", self.request(Method::PUT, url).json(&req))
            .await?;
        Ok(())
    }

    async fn open_pull_request(&self, pr: &NewPullRequest) -> Result<PullRequest> {
        let url = self.repo_url(["pulls"])?;
        let res = self
            .send("create pull request", self.request(Method::POST, url).json(pr))
            .await?;
        Ok(res.json::<PullRequest>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query, State},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };
    use tokio::net::TcpListener;

    fn client() -> GitHubClient {
        GitHubClient::new(&ServerConfig::default())
    }

    #[test]
    fn repo_url_encodes_each_segment() {
        let url = client()
            .repo_url(["contents", "public", "uploads", "操作系统", "a b.pdf"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.github.com/repos/jing-gou/njupt-notes/contents/public/uploads/%E6%93%8D%E4%BD%9C%E7%B3%BB%E7%BB%9F/a%20b.pdf"
        );
    }

    #[test]
    fn upstream_error_prefers_provider_message() {
        let err = upstream_error(
            "get tree",
            StatusCode::UNAUTHORIZED,
            r#"{"message":"Bad credentials"}"#.into(),
        );
        assert_eq!(err.to_string(), "GitHub get tree failed (401): Bad credentials");

        let err = upstream_error("get tree", StatusCode::BAD_GATEWAY, "oops".into());
        assert_eq!(err.to_string(), "GitHub get tree failed (502): oops");
    }

    #[test]
    fn tree_response_parses_blobs_and_trees() {
        let raw = r#"{
            "sha": "abc",
            "tree": [
                {"path": "public/uploads/OS", "mode": "040000", "type": "tree", "sha": "t1"},
                {"path": "public/uploads/OS/midterm.pdf", "mode": "100644", "type": "blob", "sha": "b1", "size": 2048}
            ],
            "truncated": false
        }"#;
        let tree: RepositoryTree = serde_json::from_str(raw).unwrap();
        assert_eq!(tree.entries.len(), 2);
        assert_eq!(tree.entries[0].kind, EntryKind::Tree);
        assert_eq!(tree.entries[0].size, None);
        assert_eq!(tree.entries[1].kind, EntryKind::Blob);
        assert_eq!(tree.entries[1].size, Some(2048));
        assert!(!tree.truncated);
    }

    // -------------------------------------------------------------------------
    // Local GitHub stand-in
    // -------------------------------------------------------------------------

    /// Request bodies seen by the stand-in, tagged by operation.
    type Seen = Arc<Mutex<Vec<(String, Value)>>>;

    const EXISTING_FILE: &str = "public/uploads/OS/old.pdf";

    async fn get_ref(
        Path((_, _, branch)): Path<(String, String, String)>,
    ) -> (StatusCode, Json<Value>) {
        match branch.as_str() {
            "master" => (
                StatusCode::OK,
                Json(json!({"ref": "refs/heads/master", "object": {"sha": "master-tip", "type": "commit"}})),
            ),
            "locked" => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"message": "Bad credentials"})),
            ),
            _ => (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))),
        }
    }

    async fn create_ref(State(seen): State<Seen>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        seen.lock().unwrap().push(("create ref".into(), body));
        (StatusCode::CREATED, Json(json!({"ref": "refs/heads/contrib-1"})))
    }

    async fn get_contents(
        Path((_, _, path)): Path<(String, String, String)>,
        Query(query): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<Value>) {
        let on_branch = query.get("ref").map(String::as_str) == Some("contrib-1");
        if path.trim_start_matches('/') == EXISTING_FILE && on_branch {
            (StatusCode::OK, Json(json!({"type": "file", "sha": "old-blob"})))
        } else {
            (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"})))
        }
    }

    async fn put_contents(
        State(seen): State<Seen>,
        Path((_, _, path)): Path<(String, String, String)>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let tag = format!("put {}", path.trim_start_matches('/'));
        seen.lock().unwrap().push((tag, body));
        (StatusCode::CREATED, Json(json!({"content": {}})))
    }

    async fn create_pull(State(seen): State<Seen>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        seen.lock().unwrap().push(("create pull request".into(), body));
        (
            StatusCode::CREATED,
            Json(json!({"number": 7, "html_url": "https://github.com/jing-gou/njupt-notes/pull/7"})),
        )
    }

    async fn stand_in() -> (GitHubClient, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/repos/:owner/:repo/git/ref/heads/:branch", get(get_ref))
            .route("/repos/:owner/:repo/git/refs", post(create_ref))
            .route(
                "/repos/:owner/:repo/contents/*path",
                get(get_contents).put(put_contents),
            )
            .route("/repos/:owner/:repo/pulls", post(create_pull))
            .with_state(seen.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let cfg = ServerConfig {
            api_url: format!("http://{}", addr),
            github_token: Some("ghp_test".into()),
            ..ServerConfig::default()
        };
        let github = GitHubClient {
            client: Client::builder().no_proxy().build().unwrap(),
            ..GitHubClient::new(&cfg)
        };
        (github, seen)
    }

    fn write(path: &str) -> FileWrite {
        FileWrite {
            path: path.into(),
            branch: "contrib-1".into(),
            message: "feat: contribute material - OS [skip ci]".into(),
            content_base64: "aGVsbG8=".into(),
        }
    }

    #[tokio::test]
    async fn branch_ref_maps_missing_branch_to_none() {
        let (github, _) = stand_in().await;

        assert_eq!(github.branch_ref("main").await.unwrap(), None);
        assert_eq!(
            github.branch_ref("master").await.unwrap(),
            Some(BranchRef {
                name: "master".into(),
                commit_sha: "master-tip".into(),
            })
        );
    }

    #[tokio::test]
    async fn branch_ref_error_carries_provider_message() {
        let (github, _) = stand_in().await;

        let err = github.branch_ref("locked").await.unwrap_err();
        assert_eq!(err.to_string(), "GitHub get ref failed (401): Bad credentials");
    }

    #[tokio::test]
    async fn new_file_is_written_without_sha() {
        let (github, seen) = stand_in().await;

        github.write_file(&write("public/uploads/OS/new.pdf")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "put public/uploads/OS/new.pdf");
        assert_eq!(
            seen[0].1,
            json!({
                "message": "feat: contribute material - OS [skip ci]",
                "content": "aGVsbG8=",
                "branch": "contrib-1"
            })
        );
    }

    #[tokio::test]
    async fn existing_file_is_overwritten_with_its_sha() {
        let (github, seen) = stand_in().await;

        github.write_file(&write(EXISTING_FILE)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, format!("put {}", EXISTING_FILE));
        assert_eq!(seen[0].1["sha"], "old-blob");
        assert_eq!(seen[0].1["branch"], "contrib-1");
    }

    #[tokio::test]
    async fn branch_and_pull_request_bodies() {
        let (github, seen) = stand_in().await;

        github.create_branch("contrib-1", "main-tip").await.unwrap();
        let pr = github
            .open_pull_request(&NewPullRequest {
                title: "[Contribution] OS - 复习笔记".into(),
                head: "contrib-1".into(),
                base: "main".into(),
                body: "- Course: OS".into(),
                draft: true,
            })
            .await
            .unwrap();

        assert_eq!(pr.number, 7);
        assert_eq!(pr.html_url, "https://github.com/jing-gou/njupt-notes/pull/7");

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            (
                "create ref".to_string(),
                json!({"ref": "refs/heads/contrib-1", "sha": "main-tip"})
            )
        );
        assert_eq!(seen[1].0, "create pull request");
        assert_eq!(
            seen[1].1,
            json!({
                "title": "[Contribution] OS - 复习笔记",
                "head": "contrib-1",
                "base": "main",
                "body": "- Course: OS",
                "draft": true
            })
        );
    }
}
