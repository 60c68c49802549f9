//! Hand-off of finished documents to a repository.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::retry::{RetryPolicy, Retryable};

/// Upload failures.
#[derive(thiserror::Error, Debug)]
pub enum UploadError {
    /// The document or the destination could not be accessed.
    #[error("upload {path}: {source}")]
    Io {
        /// Document path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The repository refused the document.
    #[error("upload rejected: {0}")]
    Rejected(String),
}

impl Retryable for UploadError {
    fn is_transient(&self) -> bool {
        match self {
            UploadError::Io { source, .. } => !matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            UploadError::Rejected(_) => false,
        }
    }
}

/// Outcome for one document.
#[derive(Debug)]
pub struct UploadResult {
    /// Local document path.
    pub document: PathBuf,
    /// Repository identifier on success.
    pub outcome: Result<String, UploadError>,
}

/// A repository accepting record documents.
///
/// Uploading the same document twice must leave one copy, keyed by its file name.
pub trait Uploader {
    /// Upload one document; returns the repository identifier.
    fn upload_document(&self, document: &Path) -> Result<String, UploadError>;

    /// Upload every document with bounded retries; failures are logged, not raised.
    fn upload(&self, documents: &[PathBuf], retry: &RetryPolicy) -> Vec<UploadResult> {
        documents
            .iter()
            .map(|doc| {
                let outcome = retry.run("upload", || self.upload_document(doc));
                match &outcome {
                    Ok(id) => info!(document = %doc.display(), id = %id, "uploaded"),
                    Err(err) => warn!(document = %doc.display(), error = %err, "upload failed"),
                }
                UploadResult {
                    document: doc.clone(),
                    outcome,
                }
            })
            .collect()
    }
}

/// Copies documents into a directory (a repository inbox or a mounted share).
#[derive(Debug, Clone)]
pub struct DirectoryUploader {
    dest: PathBuf,
}

impl DirectoryUploader {
    /// Uploader writing into `dest`.
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }
}

impl Uploader for DirectoryUploader {
    fn upload_document(&self, document: &Path) -> Result<String, UploadError> {
        let name = document
            .file_name()
            .ok_or_else(|| UploadError::Rejected(format!("{} has no file name", document.display())))?;
        std::fs::create_dir_all(&self.dest).map_err(|source| UploadError::Io {
            path: self.dest.clone(),
            source,
        })?;
        let target = self.dest.join(name);
        std::fs::copy(document, &target).map_err(|source| UploadError::Io {
            path: document.to_path_buf(),
            source,
        })?;
        Ok(name.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("titan_s1.json");
        std::fs::write(&doc, "{}").unwrap();
        let up = DirectoryUploader::new(dir.path().join("inbox"));

        let first = up.upload(&[doc.clone()], &RetryPolicy::immediate(2));
        let second = up.upload(&[doc], &RetryPolicy::immediate(2));
        assert_eq!(first[0].outcome.as_ref().unwrap(), "titan_s1.json");
        assert!(second[0].outcome.is_ok());
        assert_eq!(std::fs::read_dir(dir.path().join("inbox")).unwrap().count(), 1);
    }

    #[test]
    fn missing_document_fails_without_retrying_forever() {
        let dir = tempfile::tempdir().unwrap();
        let up = DirectoryUploader::new(dir.path().join("inbox"));
        let res = up.upload(&[dir.path().join("gone.json")], &RetryPolicy::immediate(3));
        let err = res[0].outcome.as_ref().unwrap_err();
        assert!(!err.is_transient());
    }
}
