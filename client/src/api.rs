use anyhow::{anyhow, Context, Result};
use reqwest::{blocking::Client, StatusCode};
use tracing::debug;

use crate::queue::Contributor;
use crate::wire::{ContributionResponse, CourseIndex, ErrorBody, Submission};

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Talks to the notes server, e.g. `http://localhost:8080/api`.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        ApiClient {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// GET /resources
    pub fn fetch_index(&self) -> Result<CourseIndex> {
        let url = format!("{}/resources", self.base_url);
        let res = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("could not reach {}", url))?;

        let status = res.status();
        debug!("GET {} -> {}", url, status);
        if !status.is_success() {
            return Err(rejection(status, &res.text().unwrap_or_default()));
        }

        Ok(res.json::<CourseIndex>()?)
    }
}

impl Contributor for ApiClient {
    /// POST /upload
    fn contribute(&self, submission: &Submission) -> Result<String> {
        let url = format!("{}/upload", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(submission)
            .send()
            .with_context(|| format!("could not reach {}", url))?;

        let status = res.status();
        debug!("POST {} -> {}", url, status);
        if !status.is_success() {
            return Err(rejection(status, &res.text().unwrap_or_default()));
        }

        let body = res.json::<ContributionResponse>()?;
        if !body.success || body.pr_url.is_empty() {
            return Err(anyhow!("server did not confirm the upload"));
        }
        Ok(body.pr_url)
    }
}

/// Error for a non-success response, using the server's `{"error": ...}`
/// envelope when present.
fn rejection(status: StatusCode, body: &str) -> anyhow::Error {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(envelope) => anyhow!("server rejected request ({}): {}", status.as_u16(), envelope.error),
        Err(_) => anyhow!("server rejected request ({})", status.as_u16()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_uses_error_envelope() {
        let err = rejection(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":"GitHub write file failed (409): conflict"}"#,
        );
        assert_eq!(
            err.to_string(),
            "server rejected request (500): GitHub write file failed (409): conflict"
        );
    }

    #[test]
    fn rejection_without_envelope_keeps_status() {
        let err = rejection(StatusCode::PAYLOAD_TOO_LARGE, "");
        assert_eq!(err.to_string(), "server rejected request (413)");
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let api = ApiClient::new("http://localhost:8080/api/");
        assert_eq!(api.base_url, "http://localhost:8080/api");
    }
}
