use anyhow::{Context, Result};
use std::{env, net::SocketAddr, path::PathBuf};

/// Decoded-content budget for a single contribution (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Server configuration, read once at startup.
///
/// Every field has a default except the GitHub token, which is only needed
/// by the contribution endpoint and is checked there.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub github_token: Option<String>,
    pub api_url: String,
    pub raw_url: String,
    pub owner: String,
    pub repo: String,
    /// Directory inside the repository that holds shareable files.
    /// Always ends with a single `/`.
    pub watched_prefix: String,
    /// Branch the listing reads from and download URLs point at.
    pub listing_branch: String,
    pub max_upload_bytes: usize,
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            github_token: None,
            api_url: "https://api.github.com".into(),
            raw_url: "https://raw.githubusercontent.com".into(),
            owner: "jing-gou".into(),
            repo: "njupt-notes".into(),
            watched_prefix: "public/uploads/".into(),
            listing_branch: "main".into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            static_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = ServerConfig::default();

        let bind = match env::var("NOTES_BIND") {
            Ok(v) => v
                .parse::<SocketAddr>()
                .with_context(|| format!("NOTES_BIND is not a socket address: {}", v))?,
            Err(_) => defaults.bind,
        };

        let max_upload_bytes = match env::var("NOTES_MAX_UPLOAD_BYTES") {
            Ok(v) => v
                .parse::<usize>()
                .with_context(|| format!("NOTES_MAX_UPLOAD_BYTES is not a number: {}", v))?,
            Err(_) => defaults.max_upload_bytes,
        };

        let github_token = env::var("GITHUB_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(ServerConfig {
            bind,
            github_token,
            api_url: env::var("GITHUB_API_URL").unwrap_or(defaults.api_url),
            raw_url: env::var("GITHUB_RAW_URL").unwrap_or(defaults.raw_url),
            owner: env::var("NOTES_REPO_OWNER").unwrap_or(defaults.owner),
            repo: env::var("NOTES_REPO_NAME").unwrap_or(defaults.repo),
            watched_prefix: normalize_prefix(
                &env::var("NOTES_WATCHED_PREFIX").unwrap_or(defaults.watched_prefix),
            ),
            listing_branch: env::var("NOTES_LISTING_BRANCH").unwrap_or(defaults.listing_branch),
            max_upload_bytes,
            static_dir: env::var("NOTES_STATIC_DIR").ok().map(PathBuf::from),
        })
    }

    /// Size limit for the raw request body: base64 inflates the decoded
    /// budget by 4/3, plus slack for the JSON envelope.
    pub fn body_limit_bytes(&self) -> usize {
        self.max_upload_bytes / 3 * 4 + 64 * 1024
    }
}

/// Strips leading slashes and guarantees exactly one trailing slash, so a
/// prefix never matches a sibling directory sharing its name.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}
