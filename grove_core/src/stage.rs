//! Pending changes between commits.
//!
//! A [`Changeset`] maps normalized repository paths to a blob write or a
//! deletion. The repository persists its changeset as JSON in
//! `grove/STAGE`, guarded by `grove/STAGE.lock`, so staging and committing
//! can happen in separate calls (or processes).

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::lockfile::LockFile;
use crate::tree::FileMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One staged change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    /// Set the path to this blob.
    Write { blob: ObjectId, mode: FileMode },
    /// Remove the path.
    Delete,
}

/// Path → change, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    changes: BTreeMap<String, Change>,
}

impl Changeset {
    /// Empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a blob at `path`.
    pub fn write(&mut self, path: &str, blob: ObjectId, mode: FileMode) -> Result<()> {
        if !mode.is_blob() && mode != FileMode::Gitlink {
            return Err(Error::invalid_path(path, "a directory cannot be staged"));
        }
        let path = normalize_path(path)?;
        if let Some(other) = self.conflicting_write(&path) {
            return Err(Error::invalid_path(
                path,
                format!("conflicts with staged file {}", other),
            ));
        }
        self.changes.insert(path, Change::Write { blob, mode });
        Ok(())
    }

    /// A staged write that would need `path` to be both a file and a
    /// directory: one at an ancestor of `path`, or one below it.
    fn conflicting_write(&self, path: &str) -> Option<String> {
        let is_write = |change: Option<&Change>| matches!(change, Some(Change::Write { .. }));

        if let Some((end, _)) = path
            .match_indices('/')
            .find(|(end, _)| is_write(self.changes.get(&path[..*end])))
        {
            return Some(path[..end].to_string());
        }

        let dir = format!("{}/", path);
        self.changes
            .range(dir.clone()..)
            .take_while(|(other, _)| other.starts_with(&dir))
            .find(|&(_, change)| is_write(Some(change)))
            .map(|(other, _)| other.clone())
    }

    /// Stage a deletion of `path`.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        self.changes.insert(path, Change::Delete);
        Ok(())
    }

    /// Drop whatever is staged at `path`.
    pub fn unstage(&mut self, path: &str) -> Result<Option<Change>> {
        Ok(self.changes.remove(&normalize_path(path)?))
    }

    /// Change staged at a normalized path.
    pub fn get(&self, path: &str) -> Option<&Change> {
        self.changes.get(path)
    }

    /// Iterate in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Change)> {
        self.changes.iter().map(|(path, change)| (path.as_str(), change))
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Remove entries identical to ones in `committed`.
    ///
    /// Entries re-staged with a different value since `committed` was taken
    /// are kept.
    pub fn remove_committed(&mut self, committed: &Changeset) {
        for (path, change) in &committed.changes {
            if self.changes.get(path) == Some(change) {
                self.changes.remove(path);
            }
        }
    }
}

/// Normalize a repository-relative path: `a//b/./c` → `a/b/c`.
///
/// Rejects empty paths, absolute paths, `..` components, `.git` components and NUL.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.starts_with('/') {
        return Err(Error::invalid_path(path, "absolute paths are not allowed"));
    }
    if path.contains('\0') {
        return Err(Error::invalid_path(path, "contains NUL"));
    }

    let mut parts = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(Error::invalid_path(path, "escapes the repository root")),
            c if c.eq_ignore_ascii_case(".git") => {
                return Err(Error::invalid_path(path, "names .git"));
            }
            c => parts.push(c),
        }
    }

    if parts.is_empty() {
        return Err(Error::invalid_path(path, "empty path"));
    }
    Ok(parts.join("/"))
}

/// A file read from a caller's checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub content: Vec<u8>,
    pub mode: FileMode,
}

/// Read `relative` from `source_dir`. `None` if it does not exist.
///
/// Symlinks are not followed: their target text becomes the blob.
pub fn read_source_file(source_dir: &Path, relative: &str) -> Result<Option<SourceFile>> {
    let full = source_dir.join(relative);
    let metadata = match fs::symlink_metadata(&full) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    if metadata.is_dir() {
        return Err(Error::is_a_directory(relative));
    }
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(&full)?;
        return Ok(Some(SourceFile {
            content: link_target_bytes(&target),
            mode: FileMode::Symlink,
        }));
    }

    Ok(Some(SourceFile {
        content: fs::read(&full)?,
        mode: file_mode(&metadata),
    }))
}

#[cfg(unix)]
fn link_target_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn link_target_bytes(target: &Path) -> Vec<u8> {
    target.to_string_lossy().replace('\\', "/").into_bytes()
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        FileMode::Executable
    } else {
        FileMode::Regular
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> FileMode {
    FileMode::Regular
}

/// The persisted changeset of one repository.
#[derive(Debug, Clone)]
pub struct Stage {
    path: PathBuf,
}

impl Stage {
    /// Stage file of the repository at `git_dir`.
    pub fn new(git_dir: &Path) -> Self {
        Self {
            path: git_dir.join("grove").join("STAGE"),
        }
    }

    /// Read the current changeset (empty if nothing is staged).
    pub fn load(&self) -> Result<Changeset> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Changeset::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply `f` to the changeset under the stage lock and persist the result.
    ///
    /// Nothing is written if `f` fails.
    pub fn modify<T>(&self, f: impl FnOnce(&mut Changeset) -> Result<T>) -> Result<T> {
        let lock = LockFile::acquire(&self.path)?.ok_or_else(|| {
            warn!(path = %self.path.display(), "stage lock held by another writer");
            Error::StageLocked {
                path: self.path.clone(),
            }
        })?;

        let mut changeset = self.load()?;
        let value = f(&mut changeset)?;
        lock.commit(&serde_json::to_vec_pretty(&changeset)?)?;
        debug!(entries = changeset.len(), "stage written");
        Ok(value)
    }

    /// Forget everything staged.
    pub fn clear(&self) -> Result<()> {
        self.modify(|changeset| {
            *changeset = Changeset::new();
            Ok(())
        })
    }
}
