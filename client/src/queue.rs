use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::wire::Submission;

/// Per-file limit enforced at selection time (4.5 MiB), below the hosting
/// platform's request payload limit once base64-encoded.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 4_718_592;

// -----------------------------------------------------------------------------
// Types
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEntry {
    pub id: u64,
    pub source: PathBuf,
    pub proposed_name: String,
    pub size: u64,
    pub status: UploadStatus,
    /// Coarse estimate: 0 queued, 50 read locally, 100 acknowledged.
    pub progress: u8,
    pub error: Option<String>,
    pub pr_url: Option<String>,
}

/// A file the user picked, before it is accepted into the queue.
#[derive(Debug, Clone)]
pub struct Selection {
    pub path: PathBuf,
    pub size: u64,
}

/// Reported inline for files that never made it into the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub uploading: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Course and category applied to every file of a batch.
#[derive(Debug, Clone)]
pub struct BatchTarget {
    pub course: String,
    pub category: String,
}

// -----------------------------------------------------------------------------
// Seams
// -----------------------------------------------------------------------------

pub trait SourceReader {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Reads straight from the local filesystem.
pub struct FsReader;

impl SourceReader for FsReader {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }
}

/// Accepts one submission and returns the pull request URL.
pub trait Contributor {
    fn contribute(&self, submission: &Submission) -> Result<String>;
}

// -----------------------------------------------------------------------------
// Queue
// -----------------------------------------------------------------------------

pub struct UploadQueue {
    entries: Vec<UploadEntry>,
    next_id: u64,
    max_file_bytes: u64,
}

impl UploadQueue {
    pub fn new(max_file_bytes: u64) -> Self {
        UploadQueue {
            entries: Vec::new(),
            next_id: 1,
            max_file_bytes,
        }
    }

    pub fn entries(&self) -> &[UploadEntry] {
        &self.entries
    }

    /// Accepts every selection within the size bound as a pending entry and
    /// reports one validation error per rejected file.
    pub fn select(&mut self, selections: impl IntoIterator<Item = Selection>) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for sel in selections {
            if sel.size > self.max_file_bytes {
                errors.push(ValidationError {
                    message: format!(
                        "file is too large: {} (limit {})",
                        format_mib(sel.size),
                        format_mib(self.max_file_bytes)
                    ),
                    path: sel.path,
                });
                continue;
            }

            let Some(name) = sel.path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                errors.push(ValidationError {
                    message: "not a file".into(),
                    path: sel.path,
                });
                continue;
            };

            self.entries.push(UploadEntry {
                id: self.next_id,
                source: sel.path,
                proposed_name: name,
                size: sel.size,
                status: UploadStatus::Pending,
                progress: 0,
                error: None,
                pr_url: None,
            });
            self.next_id += 1;
        }

        errors
    }

    /// Like [`select`](Self::select) for paths on disk; directories expand to
    /// the regular files beneath them.
    pub fn select_paths(&mut self, paths: &[PathBuf]) -> Vec<ValidationError> {
        let mut selections = Vec::new();
        let mut errors = Vec::new();

        for path in paths {
            for entry in WalkDir::new(path).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        errors.push(ValidationError {
                            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| path.clone()),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                match entry.metadata() {
                    Ok(meta) => selections.push(Selection {
                        path: entry.into_path(),
                        size: meta.len(),
                    }),
                    Err(e) => errors.push(ValidationError {
                        path: entry.into_path(),
                        message: e.to_string(),
                    }),
                }
            }
        }

        errors.extend(self.select(selections));
        errors
    }

    /// Replaces the stem of the proposed name, keeping the source extension.
    pub fn rename(&mut self, id: u64, new_stem: &str) -> Result<()> {
        let stem = new_stem.trim();
        if stem.is_empty() {
            bail!("new name is empty");
        }

        let entry = self.entry_mut(id)?;
        if entry.status != UploadStatus::Pending {
            bail!("only pending uploads can be renamed");
        }

        entry.proposed_name = match entry.source.extension() {
            Some(ext) => format!("{}.{}", stem, ext.to_string_lossy()),
            None => stem.to_string(),
        };
        Ok(())
    }

    /// Drops an entry that is not currently uploading.
    pub fn remove(&mut self, id: u64) -> Result<UploadEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| anyhow!("no upload with id {}", id))?;

        if self.entries[pos].status == UploadStatus::Uploading {
            bail!("upload {} is in flight and cannot be removed", id);
        }
        Ok(self.entries.remove(pos))
    }

    /// Removes every entry proposed under `name`, returning how many went.
    pub fn remove_named(&mut self, name: &str) -> Result<usize> {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.proposed_name == name)
            .map(|e| e.id)
            .collect();
        for &id in &ids {
            self.remove(id)?;
        }
        Ok(ids.len())
    }

    /// Moves failed entries back to pending so the next batch retries them.
    pub fn requeue_failed(&mut self) -> usize {
        let mut n = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.status == UploadStatus::Failed)
        {
            entry.status = UploadStatus::Pending;
            entry.progress = 0;
            entry.error = None;
            n += 1;
        }
        n
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in &self.entries {
            match entry.status {
                UploadStatus::Pending => counts.pending += 1,
                UploadStatus::Uploading => counts.uploading += 1,
                UploadStatus::Succeeded => counts.succeeded += 1,
                UploadStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Drives every pending entry through read, encode, submit, one at a
    /// time in queue order. `on_update` sees each entry after every status
    /// or progress change.
    ///
    /// Input problems are reported before anything is read or sent.
    pub fn run_batch(
        &mut self,
        target: &BatchTarget,
        reader: &dyn SourceReader,
        contributor: &dyn Contributor,
        mut on_update: impl FnMut(&UploadEntry),
    ) -> Result<StatusCounts> {
        if target.course.trim().is_empty() {
            bail!("a course name is required");
        }
        if !self
            .entries
            .iter()
            .any(|e| e.status == UploadStatus::Pending)
        {
            bail!("no pending files to upload");
        }

        for idx in 0..self.entries.len() {
            if self.entries[idx].status != UploadStatus::Pending {
                continue;
            }

            self.set_state(idx, UploadStatus::Uploading, 0);
            on_update(&self.entries[idx]);

            let source = self.entries[idx].source.clone();
            let bytes = match reader.read(&source) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.fail(idx, format!("could not read {}: {}", source.display(), e));
                    on_update(&self.entries[idx]);
                    continue;
                }
            };

            self.set_state(idx, UploadStatus::Uploading, 50);
            on_update(&self.entries[idx]);

            let submission = Submission {
                file_name: self.entries[idx].proposed_name.clone(),
                content: STANDARD.encode(&bytes),
                course: target.course.trim().to_string(),
                category: target.category.clone(),
            };

            match contributor.contribute(&submission) {
                Ok(pr_url) => {
                    info!("{} uploaded: {}", submission.file_name, pr_url);
                    self.set_state(idx, UploadStatus::Succeeded, 100);
                    self.entries[idx].pr_url = Some(pr_url);
                }
                Err(e) => {
                    warn!("{} failed: {:#}", submission.file_name, e);
                    self.fail(idx, e.to_string());
                }
            }
            on_update(&self.entries[idx]);
        }

        Ok(self.counts())
    }

    fn entry_mut(&mut self, id: u64) -> Result<&mut UploadEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("no upload with id {}", id))
    }

    fn set_state(&mut self, idx: usize, status: UploadStatus, progress: u8) {
        let entry = &mut self.entries[idx];
        entry.status = status;
        entry.progress = progress;
    }

    fn fail(&mut self, idx: usize, message: String) {
        let entry = &mut self.entries[idx];
        entry.status = UploadStatus::Failed;
        entry.error = Some(message);
    }
}

fn format_mib(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}
