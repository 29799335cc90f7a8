//! Error types for grove_core.

use std::path::PathBuf;
use thiserror::Error;

use crate::hash::ObjectId;

/// Result type alias using grove_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during repository operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Object bytes failed inflation, codec validation or hash verification.
    #[error("Corrupt object {id}: {reason}")]
    CorruptObject { id: String, reason: String },

    /// Object not found in the store.
    #[error("Object not found: {id}")]
    ObjectNotFound { id: ObjectId },

    /// An object exists but has a different kind than requested.
    #[error("Object {id} is a {got}, expected a {expected}")]
    UnexpectedObjectKind {
        id: ObjectId,
        expected: &'static str,
        got: &'static str,
    },

    /// Invalid object id text.
    #[error("Invalid object id: {reason}")]
    InvalidObjectId { reason: String },

    /// Repository directory is missing or malformed.
    #[error("Invalid repository at {path}: {reason}")]
    InvalidRepository { path: PathBuf, reason: String },

    /// Ref name rejected by the ref-name rules.
    #[error("Invalid ref name {name:?}: {reason}")]
    InvalidRefName { name: String, reason: String },

    /// Ref does not exist.
    #[error("Ref not found: {name}")]
    RefNotFound { name: String },

    /// Compare-and-swap on a ref failed, or the ref is locked by another writer.
    #[error("Ref {name} changed concurrently (expected {expected}, found {actual})")]
    RefConflict {
        name: String,
        expected: String,
        actual: String,
    },

    /// A ref or repository with this name already exists.
    #[error("Already exists: {name}")]
    AlreadyExists { name: String },

    /// Branch moved while a commit or merge was being built.
    #[error("Branch {branch} moved concurrently; re-resolve and retry")]
    NonFastForward { branch: String },

    /// Staged changes produce the tree the branch already has.
    #[error("Nothing to commit")]
    NothingToCommit,

    /// Three-way merge found conflicting paths.
    #[error("Merge conflict in {} path(s): {}", paths.len(), paths.join(", "))]
    MergeConflict { paths: Vec<String> },

    /// Branches share no common ancestor.
    #[error("Refusing to merge unrelated histories: {source_ref} and {target_ref}")]
    UnrelatedHistories {
        source_ref: String,
        target_ref: String,
    },

    /// Source ref of a branch or merge does not resolve.
    #[error("Source not found: {name}")]
    SourceNotFound { name: String },

    /// Target ref of a merge does not resolve.
    #[error("Target not found: {name}")]
    TargetNotFound { name: String },

    /// Tree path does not exist at the given ref.
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    /// Tree path names a directory where a file was requested.
    #[error("Is a directory: {path}")]
    IsADirectory { path: String },

    /// Repository-relative path rejected during normalization.
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// File to stage is absent from both the source directory and HEAD.
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Staging file is locked by another writer.
    #[error("Staging area at {path} is locked by another writer")]
    StageLocked { path: PathBuf },

    /// Staging file could not be (de)serialized.
    #[error("Staging file error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a CorruptObject error.
    pub fn corrupt_object(id: impl ToString, reason: impl Into<String>) -> Self {
        Error::CorruptObject {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an ObjectNotFound error.
    pub fn object_not_found(id: ObjectId) -> Self {
        Error::ObjectNotFound { id }
    }

    /// Create an UnexpectedObjectKind error.
    pub fn unexpected_kind(id: ObjectId, expected: &'static str, got: &'static str) -> Self {
        Error::UnexpectedObjectKind { id, expected, got }
    }

    /// Create an InvalidObjectId error.
    pub fn invalid_object_id(reason: impl Into<String>) -> Self {
        Error::InvalidObjectId {
            reason: reason.into(),
        }
    }

    /// Create an InvalidRepository error.
    pub fn invalid_repository(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidRepository {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidRefName error.
    pub fn invalid_ref_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidRefName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a RefNotFound error.
    pub fn ref_not_found(name: impl Into<String>) -> Self {
        Error::RefNotFound { name: name.into() }
    }

    /// Create a RefConflict error. `None` renders as `(none)`.
    pub fn ref_conflict(
        name: impl Into<String>,
        expected: Option<ObjectId>,
        actual: Option<ObjectId>,
    ) -> Self {
        let show = |id: Option<ObjectId>| id.map_or_else(|| "(none)".to_string(), |id| id.to_hex());
        Error::RefConflict {
            name: name.into(),
            expected: show(expected),
            actual: show(actual),
        }
    }

    /// Create a RefConflict error for a ref whose lock file is held.
    pub fn ref_locked(name: impl Into<String>) -> Self {
        Error::RefConflict {
            name: name.into(),
            expected: "(unlocked)".to_string(),
            actual: "(locked)".to_string(),
        }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(name: impl Into<String>) -> Self {
        Error::AlreadyExists { name: name.into() }
    }

    /// Create a NonFastForward error.
    pub fn non_fast_forward(branch: impl Into<String>) -> Self {
        Error::NonFastForward {
            branch: branch.into(),
        }
    }

    /// Create a MergeConflict error.
    pub fn merge_conflict(paths: Vec<String>) -> Self {
        Error::MergeConflict { paths }
    }

    /// Create a PathNotFound error.
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Error::PathNotFound { path: path.into() }
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Error::IsADirectory { path: path.into() }
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a FileNotFound error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Error::FileNotFound { path: path.into() }
    }

    /// Whether the caller should re-resolve refs and try again.
    ///
    /// The engine never retries on its own.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::RefConflict { .. } | Error::NonFastForward { .. } | Error::StageLocked { .. }
        )
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}
