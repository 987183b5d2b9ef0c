use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One file as listed by `GET /api/resources`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Path below the course, sub-folders joined with `" / "`.
    pub name: String,
    /// Download URL.
    pub path: String,
    pub size: String,
    pub sha: String,
}

pub type CourseIndex = BTreeMap<String, Vec<FileDescriptor>>;

/// Body of `POST /api/upload`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub file_name: String,
    pub content: String,
    pub course: String,
    pub category: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionResponse {
    pub success: bool,
    pub pr_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
