use super::types::GenerationId;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid artifact name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("generation {0} has been released")]
    Released(GenerationId),

    #[error("generation {0} is not active in this store")]
    UnknownGeneration(GenerationId),

    /// An archive the deprecation index points at is gone. Indicates a GC bookkeeping bug.
    #[error("archived version of '{name}' for boundary {boundary} is missing")]
    MissingArchive { name: String, boundary: GenerationId },

    #[error("stored artifact '{name}' at {path} failed digest verification")]
    Corrupt { name: String, path: PathBuf },

    #[error("store root {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for misuse of a generation handle (released or foreign).
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::Released(_) | Self::UnknownGeneration(_))
    }

    /// True for faults that mean the store's own bookkeeping is broken.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::MissingArchive { .. } | Self::Corrupt { .. })
    }
}
