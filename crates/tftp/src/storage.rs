//! Destination files for incoming transfers

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWrite;

use crate::protocol::TftpErrorCode;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The filename would land outside the storage root
    #[error("access violation: {0}")]
    AccessViolation(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn code(&self) -> TftpErrorCode {
        match self {
            Self::AccessViolation(_) => TftpErrorCode::AccessViolation,
            Self::Io(_) => TftpErrorCode::DiskFull,
        }
    }
}

/// Where received files are written
#[async_trait]
pub trait Storage: Send + Sync {
    type Sink: AsyncWrite + Unpin + Send;

    /// Create or truncate the destination for `filename`
    async fn create(&self, filename: &str) -> Result<Self::Sink, StorageError>;

    /// Remove a partially written destination
    async fn discard(&self, filename: &str) -> Result<(), StorageError>;
}

/// Writes files below a root directory
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a requested filename to a path below the root.
    ///
    /// Absolute paths and `..` components are refused outright. When the
    /// parent directory already exists it is canonicalized as well, so a
    /// symlink cannot lead out of the root.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, StorageError> {
        let requested = Path::new(filename);
        if filename.is_empty() {
            return Err(StorageError::AccessViolation("empty filename".to_string()));
        }
        if !requested
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::AccessViolation(format!(
                "'{}' is outside the storage root",
                filename
            )));
        }

        let path = self.root.join(requested);
        if let Some(parent) = path.parent()
            && let Ok(parent_canon) = parent.canonicalize()
        {
            let root_canon = self.root.canonicalize()?;
            if !parent_canon.starts_with(&root_canon) {
                return Err(StorageError::AccessViolation(format!(
                    "'{}' is outside the storage root",
                    filename
                )));
            }
        }

        Ok(path)
    }
}

#[async_trait]
impl Storage for DirectoryStorage {
    type Sink = File;

    async fn create(&self, filename: &str) -> Result<File, StorageError> {
        let path = self.resolve(filename)?;
        let file = File::create(&path).await?;
        tracing::debug!("Writing '{}' to {}", filename, path.display());
        Ok(file)
    }

    async fn discard(&self, filename: &str) -> Result<(), StorageError> {
        let path = self.resolve(filename)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
