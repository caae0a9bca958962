use std::path::PathBuf;

use thiserror::Error;

/// Every way an update attempt can go wrong.
///
/// Only [`UpdateError::RollbackFailed`] is fatal: everything else means the
/// update did not happen and the original executable is still in place.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Remote unreachable, bad status, or a transport error mid-stream.
    #[error("network error: {0}")]
    Network(String),

    /// Disk read/write/permission failure.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The diff artifact is not a readable archive.
    #[error("archive error: {0}")]
    Archive(String),

    /// Malformed, missing, or mismatched manifest.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// A copy chunk reaches past the end of the base image.
    #[error("chunk {index}: copy range {offset}+{length} exceeds base length {base_len}")]
    Range {
        index: usize,
        offset: u64,
        length: u64,
        base_len: u64,
    },

    /// An insert/replace chunk names a file that is not in the package.
    #[error("chunk {index}: asset not found: {file_name}")]
    MissingAsset { index: usize, file_name: String },

    /// An insert/replace chunk names a path outside the package directory.
    #[error("chunk {index}: asset path escapes package directory: {file_name}")]
    PathViolation { index: usize, file_name: String },

    /// The reconstructed binary did not pass verification.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The attempt was cancelled before commit.
    #[error("update cancelled")]
    Cancelled,

    /// This orchestrator already has an attempt running.
    #[error("an update attempt is already in progress")]
    AlreadyInProgress,

    /// Restoring the original executable failed; manual recovery needed.
    #[error(
        "rollback failed for {} (backup kept at {}): {reason}; original failure: {cause}",
        .exe.display(),
        .backup.display()
    )]
    RollbackFailed {
        exe: PathBuf,
        backup: PathBuf,
        reason: String,
        cause: String,
    },
}

impl UpdateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        UpdateError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the executable may be left in an inconsistent state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UpdateError::RollbackFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
