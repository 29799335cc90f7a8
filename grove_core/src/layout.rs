//! Mapping of `(owner, name)` pairs to repository directories.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Longest owner or repository name accepted.
const MAX_NAME_LEN: usize = 100;

/// Storage root holding `<owner>/<name>.git` directories.
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    /// Layout under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Disk path of a repository: `<root>/<owner>/<name>.git`.
    pub fn repo_disk_path(&self, owner: &str, name: &str) -> Result<PathBuf> {
        check_segment(owner)?;
        check_segment(name)?;
        Ok(self.root.join(owner).join(format!("{}.git", name)))
    }

    /// All `(owner, name)` pairs present under the root, sorted.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let mut repos = Vec::new();
        if !self.root.is_dir() {
            return Ok(repos);
        }
        for owner in fs::read_dir(&self.root)? {
            let owner = owner?;
            if !owner.file_type()?.is_dir() {
                continue;
            }
            let owner_name = owner.file_name().to_string_lossy().into_owned();
            for repo in fs::read_dir(owner.path())? {
                let repo = repo?;
                let file_name = repo.file_name().to_string_lossy().into_owned();
                if repo.file_type()?.is_dir()
                    && let Some(name) = file_name.strip_suffix(".git")
                {
                    repos.push((owner_name.clone(), name.to_string()));
                }
            }
        }
        repos.sort();
        Ok(repos)
    }
}

/// Owner and repository names: `[A-Za-z0-9._-]`, no leading `.`, no `.git` suffix.
fn check_segment(segment: &str) -> Result<()> {
    let reject = |reason: &str| Err(Error::invalid_path(segment, reason));

    if segment.is_empty() {
        return reject("empty name");
    }
    if segment.len() > MAX_NAME_LEN {
        return reject("name too long");
    }
    if segment.starts_with('.') {
        return reject("name starts with '.'");
    }
    if segment.ends_with(".git") {
        return reject("name ends with '.git'");
    }
    if !segment
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return reject("only letters, digits, '.', '_' and '-' are allowed");
    }
    Ok(())
}
