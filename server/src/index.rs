use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::github::{EntryKind, RepositoryBlob};

/// Course used for files sitting directly under the watched prefix.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Joins sub-folder segments inside a display name.
pub const DISPLAY_SEPARATOR: &str = " / ";

/// Size label for blobs with no (or zero) size.
pub const UNKNOWN_SIZE: &str = "unknown";

/// One downloadable file as exposed on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Path below the course, segments joined with [`DISPLAY_SEPARATOR`].
    pub name: String,
    /// Raw-content download URL.
    pub path: String,
    pub size: String,
    /// Blob content hash.
    pub sha: String,
}

pub type CourseIndex = BTreeMap<String, Vec<FileDescriptor>>;

/// Where download links point: `{raw_url}/{owner}/{repo}/{branch}/{path}`.
#[derive(Debug, Clone)]
pub struct RawLocation {
    pub raw_url: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl RawLocation {
    pub fn download_url(&self, path: &str) -> String {
        let base = self.raw_url.trim_end_matches('/');
        match Url::parse(base) {
            Ok(mut url) => {
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments
                        .pop_if_empty()
                        .extend([self.owner.as_str(), self.repo.as_str(), self.branch.as_str()])
                        .extend(path.split('/'));
                }
                url.to_string()
            }
            Err(_) => format!(
                "{}/{}/{}/{}/{}",
                base, self.owner, self.repo, self.branch, path
            ),
        }
    }
}

/// Groups every blob under `prefix` by course.
///
/// `prefix` is expected in normalized form (see `config::normalize_prefix`).
/// Order within a course follows the order of `blobs`.
pub fn build_course_index(
    blobs: &[RepositoryBlob],
    prefix: &str,
    location: &RawLocation,
) -> CourseIndex {
    let mut index = CourseIndex::new();

    for blob in blobs {
        if blob.kind != EntryKind::Blob {
            continue;
        }
        let Some(relative) = blob.path.strip_prefix(prefix) else {
            continue;
        };

        let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
        let (course, name) = match segments.as_slice() {
            [] => continue,
            [file] => (UNCATEGORIZED.to_string(), file.to_string()),
            [course, rest @ ..] => (course.to_string(), rest.join(DISPLAY_SEPARATOR)),
        };

        index.entry(course).or_default().push(FileDescriptor {
            name,
            path: location.download_url(&blob.path),
            size: size_label(blob.size),
            sha: blob.sha.clone(),
        });
    }

    index
}

/// Kibibytes with one fractional digit, e.g. `2048` -> `"2.0 KB"`.
pub fn size_label(size: Option<u64>) -> String {
    match size {
        Some(bytes) if bytes > 0 => format!("{:.1} KB", bytes as f64 / 1024.0),
        _ => UNKNOWN_SIZE.to_string(),
    }
}
