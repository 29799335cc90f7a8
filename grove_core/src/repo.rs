//! Bare repositories: layout, branches, staging, commits, reads and forks.

use crate::config::RepoConfig;
use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{Commit, ObjectKind, Signature};
use crate::reflog::Reason;
use crate::refs::{HEADS, RefStore, TAGS, branch_ref, check_ref_name};
use crate::stage::{Change, Changeset, Stage, normalize_path, read_source_file};
use crate::store::ObjectStore;
use crate::tree::{FileMode, Tree, TreeEntry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Annotated tags are peeled at most this many levels.
const MAX_TAG_DEPTH: usize = 16;

const DESCRIPTION: &str = "Unnamed repository; edit this file 'description' to name the repository.\n";

/// A file read from a commit's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileAtRef {
    pub path: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    pub id: ObjectId,
    pub size: u64,
    pub mode: FileMode,
}

impl FileAtRef {
    /// Content as text, if it is valid UTF-8.
    pub fn content_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// What a fork produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForkSummary {
    pub default_branch: String,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
    pub objects_copied: usize,
}

/// A bare, Git-compatible repository on disk.
#[derive(Debug, Clone)]
pub struct Repository {
    git_dir: PathBuf,
    config: RepoConfig,
    objects: ObjectStore,
    refs: RefStore,
    stage: Stage,
}

impl Repository {
    /// Initialize a bare repository whose HEAD points at `default_branch`.
    ///
    /// Creates the directory structure:
    /// - `objects/` for loose objects
    /// - `refs/heads/` and `refs/tags/`
    /// - `HEAD`, `config` and `description`
    pub fn init(path: impl AsRef<Path>, default_branch: &str) -> Result<Self> {
        Self::init_with_config(path, default_branch, RepoConfig::default())
    }

    /// Initialize with explicit settings.
    pub fn init_with_config(
        path: impl AsRef<Path>,
        default_branch: &str,
        config: RepoConfig,
    ) -> Result<Self> {
        let git_dir = path.as_ref().to_path_buf();
        let head_ref = branch_ref(default_branch);
        check_ref_name(&head_ref)?;

        if git_dir.join("HEAD").exists() || git_dir.join("config").exists() {
            return Err(Error::already_exists(git_dir.display().to_string()));
        }

        fs::create_dir_all(git_dir.join("objects").join("info"))?;
        fs::create_dir_all(git_dir.join("objects").join("pack"))?;
        fs::create_dir_all(git_dir.join("refs").join("heads"))?;
        fs::create_dir_all(git_dir.join("refs").join("tags"))?;
        config.write_new(&git_dir)?;
        fs::write(git_dir.join("description"), DESCRIPTION)?;
        fs::write(git_dir.join("HEAD"), format!("ref: {}\n", head_ref))?;

        info!(path = %git_dir.display(), default_branch, "initialized repository");
        Ok(Self::assemble(git_dir, config))
    }

    /// Open an existing repository, validating its layout and config.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let git_dir = path.as_ref().to_path_buf();
        if !git_dir.is_dir() {
            return Err(Error::invalid_repository(&git_dir, "directory does not exist"));
        }
        let config = RepoConfig::load(&git_dir)?;
        for required in ["objects", "refs"] {
            if !git_dir.join(required).is_dir() {
                return Err(Error::invalid_repository(
                    &git_dir,
                    format!("{} directory missing", required),
                ));
            }
        }
        if !git_dir.join("HEAD").is_file() {
            return Err(Error::invalid_repository(&git_dir, "HEAD missing"));
        }
        debug!(path = %git_dir.display(), "opened repository");
        Ok(Self::assemble(git_dir, config))
    }

    fn assemble(git_dir: PathBuf, config: RepoConfig) -> Self {
        Self {
            objects: ObjectStore::new(git_dir.join("objects"), config.compression),
            refs: RefStore::new(&git_dir),
            stage: Stage::new(&git_dir),
            config,
            git_dir,
        }
    }

    /// Repository directory.
    pub fn path(&self) -> &Path {
        &self.git_dir
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Object store of this repository.
    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Ref store of this repository.
    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Branch HEAD points at (it may not have commits yet).
    pub fn default_branch(&self) -> Result<String> {
        match self.refs.read_symbolic("HEAD")? {
            Some(target) => match target.strip_prefix(HEADS) {
                Some(branch) => Ok(branch.to_string()),
                None => Err(Error::invalid_repository(
                    &self.git_dir,
                    format!("HEAD points outside refs/heads: {}", target),
                )),
            },
            None => Err(Error::ref_not_found("HEAD")),
        }
    }

    /// Point HEAD at an existing branch.
    pub fn set_default_branch(&self, branch: &str) -> Result<()> {
        let name = branch_ref(branch);
        if self.refs.read(&name)?.is_none() {
            return Err(Error::ref_not_found(name));
        }
        self.refs
            .set_symbolic("HEAD", &name, &Reason::system(format!("default branch: {}", branch)))
    }

    /// Resolve a ref, short name or id to a commit, peeling annotated tags.
    pub fn resolve_ref(&self, name: &str) -> Result<ObjectId> {
        let id = self
            .refs
            .resolve(name)?
            .ok_or_else(|| Error::ref_not_found(name))?;
        self.peel_to_commit(id)
    }

    fn peel_to_commit(&self, mut id: ObjectId) -> Result<ObjectId> {
        for _ in 0..MAX_TAG_DEPTH {
            let (kind, _) = self.objects.get_raw(&id)?;
            match kind {
                ObjectKind::Commit => return Ok(id),
                ObjectKind::Tag => id = self.objects.read_tag(&id)?.object,
                other => return Err(Error::unexpected_kind(id, "commit", other.as_str())),
            }
        }
        Err(Error::corrupt_object(id, "annotated tag chain too deep"))
    }

    /// Create `name` at the commit `from_ref` resolves to.
    ///
    /// With `checkout`, HEAD is pointed at the new branch.
    pub fn create_branch(&self, name: &str, from_ref: &str, checkout: bool) -> Result<ObjectId> {
        let full = branch_ref(name);
        check_ref_name(&full)?;

        let tip = match self.resolve_ref(from_ref) {
            Ok(id) => id,
            Err(Error::RefNotFound { .. }) | Err(Error::ObjectNotFound { .. }) => {
                return Err(Error::SourceNotFound {
                    name: from_ref.to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        self.refs.create(
            &full,
            tip,
            &Reason::system(format!("branch: Created from {}", from_ref)),
        )?;
        if checkout {
            self.refs
                .set_symbolic("HEAD", &full, &Reason::system(format!("checkout: moving to {}", name)))?;
        }
        info!(branch = name, from = from_ref, tip = %tip.short(), "created branch");
        Ok(tip)
    }

    /// Tree of the current tip of `branch`, if the branch has commits.
    fn branch_tree(&self, branch: &str) -> Result<Option<ObjectId>> {
        match self.refs.read(&branch_ref(branch))? {
            Some(tip) => Ok(Some(self.objects.read_commit(&tip)?.tree)),
            None => Ok(None),
        }
    }

    /// Stage files from `source_dir` (the caller's checkout).
    ///
    /// A path missing from `source_dir` but present at HEAD stages a
    /// deletion; missing from both is `FileNotFound`. Blobs are written
    /// before the stage is updated. Returns the normalized paths.
    pub fn stage_files<S: AsRef<str>>(&self, source_dir: &Path, paths: &[S]) -> Result<Vec<String>> {
        let head_tree = self.branch_tree(&self.default_branch()?)?;

        let mut pending = Vec::with_capacity(paths.len());
        for raw in paths {
            let path = normalize_path(raw.as_ref())?;
            let change = match read_source_file(source_dir, &path)? {
                Some(file) => Change::Write {
                    blob: self.objects.put_blob(&file.content)?,
                    mode: file.mode,
                },
                None => {
                    let tracked = match head_tree {
                        Some(tree) => self.find_entry(&tree, &path)?.is_some(),
                        None => false,
                    };
                    if !tracked {
                        return Err(Error::file_not_found(path));
                    }
                    Change::Delete
                }
            };
            pending.push((path, change));
        }

        self.stage.modify(|changeset| {
            for (path, change) in &pending {
                match *change {
                    Change::Write { blob, mode } => changeset.write(path, blob, mode)?,
                    Change::Delete => changeset.delete(path)?,
                }
            }
            Ok(())
        })?;
        debug!(count = pending.len(), "staged files");
        Ok(pending.into_iter().map(|(path, _)| path).collect())
    }

    /// Stage raw content at `path`.
    pub fn stage_content(&self, path: &str, content: &[u8], mode: FileMode) -> Result<ObjectId> {
        let blob = self.objects.put_blob(content)?;
        self.stage.modify(|changeset| changeset.write(path, blob, mode))?;
        Ok(blob)
    }

    /// Stage removal of `path`.
    pub fn stage_deletion(&self, path: &str) -> Result<()> {
        self.stage.modify(|changeset| changeset.delete(path))
    }

    /// Drop staged changes for `paths`.
    pub fn unstage<S: AsRef<str>>(&self, paths: &[S]) -> Result<()> {
        self.stage.modify(|changeset| {
            for path in paths {
                changeset.unstage(path.as_ref())?;
            }
            Ok(())
        })
    }

    /// Currently staged changes.
    pub fn staged(&self) -> Result<Changeset> {
        self.stage.load()
    }

    /// Discard all staged changes.
    pub fn clear_stage(&self) -> Result<()> {
        self.stage.clear()
    }

    /// Commit the staged changes onto the default branch.
    ///
    /// Only the entries that went into the commit are removed from the
    /// stage; anything re-staged meanwhile stays. A stage that changes
    /// nothing at the tip (for instance one left behind when an earlier
    /// commit could not trim it) is dropped and `NothingToCommit` returned.
    pub fn create_commit(&self, message: &str, author: &Signature) -> Result<ObjectId> {
        let changeset = self.stage.load()?;
        if changeset.is_empty() {
            return Err(Error::NothingToCommit);
        }
        let branch = self.default_branch()?;
        let id = match self.commit_changes(&branch, &changeset, message, author, author) {
            Ok(id) => id,
            Err(Error::NothingToCommit) => {
                debug!(branch, entries = changeset.len(), "stage already matches the tip");
                self.trim_stage(&changeset)?;
                return Err(Error::NothingToCommit);
            }
            Err(err) => return Err(err),
        };
        self.trim_stage(&changeset)?;
        Ok(id)
    }

    /// Remove `applied` from the stage. A held stage lock leaves the entries
    /// in place; a later `create_commit` drops them.
    fn trim_stage(&self, applied: &Changeset) -> Result<()> {
        match self.stage.modify(|current| {
            current.remove_committed(applied);
            Ok(())
        }) {
            Ok(()) => Ok(()),
            Err(Error::StageLocked { path }) => {
                warn!(path = %path.display(), "could not trim the stage");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Commit `changeset` onto the current tip of `branch`.
    pub fn commit_changes(
        &self,
        branch: &str,
        changeset: &Changeset,
        message: &str,
        author: &Signature,
        committer: &Signature,
    ) -> Result<ObjectId> {
        let name = branch_ref(branch);
        check_ref_name(&name)?;
        let parent = self.refs.read(&name)?;
        self.commit_onto(branch, parent, changeset, message, author, committer)
    }

    /// Commit `changeset` onto `parent`, advancing `branch` only if it still
    /// points at `parent` (`None`: the branch must not exist yet).
    pub fn commit_onto(
        &self,
        branch: &str,
        parent: Option<ObjectId>,
        changeset: &Changeset,
        message: &str,
        author: &Signature,
        committer: &Signature,
    ) -> Result<ObjectId> {
        let name = branch_ref(branch);
        check_ref_name(&name)?;

        let base_tree = match parent {
            Some(tip) => Some(self.objects.read_commit(&tip)?.tree),
            None => None,
        };
        let tree = self.apply_changeset(base_tree, changeset)?;
        let unchanged = match base_tree {
            Some(base) => base == tree,
            None => tree == empty_tree_id(),
        };
        if unchanged {
            return Err(Error::NothingToCommit);
        }

        let commit = Commit::new(
            tree,
            parent.into_iter().collect(),
            author.clone(),
            committer.clone(),
            with_trailing_newline(message),
        );
        let id = self.objects.put_commit(&commit)?;

        let log_message = if parent.is_some() {
            format!("commit: {}", commit.summary())
        } else {
            format!("commit (initial): {}", commit.summary())
        };
        match self
            .refs
            .update(&name, id, parent, &Reason::new(committer, log_message))
        {
            Ok(()) => {}
            Err(Error::RefConflict { .. }) => return Err(Error::non_fast_forward(branch)),
            Err(err) => return Err(err),
        }

        info!(branch, commit = %id.short(), files = changeset.len(), "created commit");
        Ok(id)
    }

    /// Write the trees for `base` plus `changeset`, returning the root tree id.
    ///
    /// Subtrees no change touches keep their ids.
    pub fn apply_changeset(&self, base: Option<ObjectId>, changeset: &Changeset) -> Result<ObjectId> {
        let changes: Vec<(&str, &Change)> = changeset.iter().collect();
        match self.build_tree(base, &changes)? {
            Some(id) => Ok(id),
            None => self.objects.put_tree(&Tree::new()),
        }
    }

    /// Apply path-relative changes to one tree level. `None` means the
    /// resulting tree is empty.
    fn build_tree(
        &self,
        base: Option<ObjectId>,
        changes: &[(&str, &Change)],
    ) -> Result<Option<ObjectId>> {
        let original = match base {
            Some(id) => self.objects.read_tree(&id)?,
            None => Tree::new(),
        };
        let mut tree = original.clone();

        // name -> (change to the name itself, changes below it)
        let mut grouped: BTreeMap<&str, (Option<&Change>, Vec<(&str, &Change)>)> = BTreeMap::new();
        for &(path, change) in changes {
            match path.split_once('/') {
                Some((head, rest)) => grouped.entry(head).or_default().1.push((rest, change)),
                None => grouped.entry(path).or_default().0 = Some(change),
            }
        }

        for (name, (own, nested)) in grouped {
            let writes_below = nested
                .iter()
                .any(|(_, change)| matches!(change, Change::Write { .. }));
            if matches!(own, Some(Change::Write { .. })) && writes_below {
                return Err(Error::invalid_path(name, "staged as both a file and a directory"));
            }
            match own {
                Some(Change::Write { blob, mode }) => {
                    tree.insert(TreeEntry::new(*mode, name, *blob)?);
                }
                Some(Change::Delete) => {
                    tree.remove(name);
                }
                None => {}
            }
            if nested.is_empty() {
                continue;
            }

            let existing = tree.get(name).cloned();
            let sub_base = existing
                .as_ref()
                .filter(|entry| entry.mode.is_tree())
                .map(|entry| entry.id);
            match self.build_tree(sub_base, &nested)? {
                Some(sub) => tree.insert(TreeEntry::new(FileMode::Directory, name, sub)?),
                // Deletions under a non-directory leave it alone.
                None if sub_base.is_some() => {
                    tree.remove(name);
                }
                None => {}
            }
        }

        if tree.is_empty() {
            return Ok(None);
        }
        if base.is_some() && tree == original {
            return Ok(base);
        }
        Ok(Some(self.objects.put_tree(&tree)?))
    }

    /// Entry at `path` under `tree`, if any.
    ///
    /// A non-final component that is not a directory counts as absent.
    pub fn find_entry(&self, tree: &ObjectId, path: &str) -> Result<Option<TreeEntry>> {
        let mut current = self.objects.read_tree(tree)?;
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            let Some(entry) = current.get(component).cloned() else {
                return Ok(None);
            };
            if components.peek().is_none() {
                return Ok(Some(entry));
            }
            if !entry.mode.is_tree() {
                return Ok(None);
            }
            current = self.objects.read_tree(&entry.id)?;
        }
        Ok(None)
    }

    /// Read a file at `path` in the commit `reference` resolves to.
    pub fn read_file_at_ref(&self, reference: &str, path: &str) -> Result<FileAtRef> {
        let path = normalize_path(path)?;
        let commit = self.objects.read_commit(&self.resolve_ref(reference)?)?;
        let entry = self
            .find_entry(&commit.tree, &path)?
            .ok_or_else(|| Error::path_not_found(path.clone()))?;

        if entry.mode.is_tree() || entry.mode == FileMode::Gitlink {
            return Err(Error::is_a_directory(path));
        }
        let content = self.objects.read_blob(&entry.id)?;
        Ok(FileAtRef {
            path,
            size: content.len() as u64,
            content,
            id: entry.id,
            mode: entry.mode,
        })
    }

    /// List the directory at `path` (empty for the root) in the commit
    /// `reference` resolves to.
    pub fn list_tree_at_ref(&self, reference: &str, path: &str) -> Result<Vec<TreeEntry>> {
        let commit = self.objects.read_commit(&self.resolve_ref(reference)?)?;
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() || trimmed == "." {
            return Ok(self.objects.read_tree(&commit.tree)?.into_entries());
        }

        let path = normalize_path(trimmed)?;
        let entry = self
            .find_entry(&commit.tree, &path)?
            .ok_or_else(|| Error::path_not_found(path.clone()))?;
        if !entry.mode.is_tree() {
            return Err(Error::invalid_path(path, "not a directory"));
        }
        Ok(self.objects.read_tree(&entry.id)?.into_entries())
    }

    /// First-parent history from `reference`, newest first.
    pub fn log(&self, reference: &str, limit: usize) -> Result<Vec<(ObjectId, Commit)>> {
        let mut next = Some(self.resolve_ref(reference)?);
        let mut history = Vec::new();
        while let Some(id) = next {
            if history.len() >= limit {
                break;
            }
            let commit = self.objects.read_commit(&id)?;
            next = commit.parents.first().copied();
            history.push((id, commit));
        }
        Ok(history)
    }

    /// Copy this repository into a new one at `target`.
    ///
    /// Every object reachable from a branch or tag is copied, then the
    /// reflogs of those refs and of HEAD, then the refs themselves; HEAD
    /// mirrors this repository's default branch. The fork shares no files
    /// with the source.
    ///
    /// `target` must not exist or be an empty directory. A failed fork
    /// removes only what it created.
    pub fn fork(&self, target: impl AsRef<Path>) -> Result<ForkSummary> {
        let target = target.as_ref();
        let default_branch = self.default_branch()?;
        let created_target = check_fork_target(target)?;

        let fork = match Self::init_with_config(target, &default_branch, self.config.clone()) {
            Ok(fork) => fork,
            // Someone else's repository appeared meanwhile; it is not ours to remove.
            Err(err @ Error::AlreadyExists { .. }) => return Err(err),
            Err(err) => return Err(abandon_fork(target, created_target, err)),
        };
        match self.populate_fork(&fork, default_branch) {
            Ok(summary) => {
                info!(
                    source = %self.git_dir.display(),
                    target = %target.display(),
                    branches = summary.branches.len(),
                    objects = summary.objects_copied,
                    "forked repository"
                );
                Ok(summary)
            }
            Err(err) => Err(abandon_fork(target, created_target, err)),
        }
    }

    fn populate_fork(&self, fork: &Repository, default_branch: String) -> Result<ForkSummary> {
        let mut refs = self.refs.list(HEADS)?;
        refs.extend(self.refs.list(TAGS)?);

        let reachable = self.objects.reachable_from(refs.iter().map(|(_, id)| *id))?;
        let mut objects_copied = 0;
        for id in &reachable {
            if self.objects.copy_raw_to(id, &fork.objects)? {
                objects_copied += 1;
            }
        }

        // History first, so the fork's own entries land after it.
        self.refs.reflog().copy_to("HEAD", fork.refs.reflog())?;
        for (name, _) in &refs {
            self.refs.reflog().copy_to(name, fork.refs.reflog())?;
        }

        let reason = Reason::system(format!("fork: from {}", self.git_dir.display()));
        let mut branches = Vec::new();
        let mut tags = Vec::new();
        for (name, id) in &refs {
            fork.refs.create(name, *id, &reason)?;
            if let Some(branch) = name.strip_prefix(HEADS) {
                branches.push(branch.to_string());
            } else if let Some(tag) = name.strip_prefix(TAGS) {
                tags.push(tag.to_string());
            }
        }

        Ok(ForkSummary {
            default_branch,
            branches,
            tags,
            objects_copied,
        })
    }
}

/// Whether `target` is free for a fork: absent (`Ok(true)`, the fork creates
/// it) or an empty directory (`Ok(false)`).
fn check_fork_target(target: &Path) -> Result<bool> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() && fs::read_dir(target)?.next().is_none() => Ok(false),
        Ok(_) => Err(Error::already_exists(target.display().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err.into()),
    }
}

/// Undo a failed fork and hand back its error. A directory that existed
/// before the fork keeps existing.
fn abandon_fork(target: &Path, created: bool, err: Error) -> Error {
    warn!(target = %target.display(), error = %err, "fork failed, removing what it created");
    if let Err(cleanup) = remove_fork_target(target, created) {
        warn!(target = %target.display(), error = %cleanup, "could not clean up fork target");
    }
    err
}

fn remove_fork_target(target: &Path, created: bool) -> Result<()> {
    if created {
        return match fs::remove_dir_all(target) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        };
    }
    for entry in fs::read_dir(target)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Id of the empty tree.
pub fn empty_tree_id() -> ObjectId {
    ObjectId::hash_object(ObjectKind::Tree, b"")
}

fn with_trailing_newline(message: &str) -> String {
    if message.ends_with('\n') {
        message.to_string()
    } else {
        format!("{}\n", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn sig(time: i64) -> Signature {
        Signature::new("Test User", "test@example.com", time, 0)
    }

    fn setup() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Repository::init(temp_dir.path().join("repo.git"), "main").unwrap();
        (temp_dir, repo)
    }

    fn commit_files(repo: &Repository, branch: &str, files: &[(&str, &str)], time: i64) -> ObjectId {
        let mut changes = Changeset::new();
        for (path, content) in files {
            let blob = repo.objects().put_blob(content.as_bytes()).unwrap();
            changes.write(path, blob, FileMode::Regular).unwrap();
        }
        repo.commit_changes(branch, &changes, "change", &sig(time), &sig(time))
            .unwrap()
    }

    #[test]
    fn test_init_layout() {
        let (tmp, repo) = setup();
        let root = tmp.path().join("repo.git");
        for dir in ["objects", "refs/heads", "refs/tags"] {
            assert!(root.join(dir).is_dir(), "{}", dir);
        }
        assert_eq!(fs::read_to_string(root.join("HEAD")).unwrap(), "ref: refs/heads/main\n");
        let config = fs::read_to_string(root.join("config")).unwrap();
        assert!(config.contains("repositoryformatversion = 0"));
        assert!(config.contains("bare = true"));
        assert!(root.join("description").is_file());
        assert_eq!(repo.default_branch().unwrap(), "main");
    }

    #[test]
    fn test_init_twice_fails() {
        let (tmp, _repo) = setup();
        assert!(matches!(
            Repository::init(tmp.path().join("repo.git"), "main"),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_open_validates() {
        let (tmp, _repo) = setup();
        assert!(Repository::open(tmp.path().join("repo.git")).is_ok());
        assert!(matches!(
            Repository::open(tmp.path().join("missing")),
            Err(Error::InvalidRepository { .. })
        ));

        fs::remove_dir_all(tmp.path().join("repo.git/refs")).unwrap();
        assert!(matches!(
            Repository::open(tmp.path().join("repo.git")),
            Err(Error::InvalidRepository { .. })
        ));
    }

    #[test]
    fn test_first_commit_and_read() {
        let (_tmp, repo) = setup();
        let id = commit_files(&repo, "main", &[("src/lib.rs", "pub fn f() {}\n")], 1);

        assert_eq!(repo.resolve_ref("main").unwrap(), id);
        let commit = repo.objects().read_commit(&id).unwrap();
        assert!(commit.parents.is_empty());
        assert!(commit.message.ends_with(b"\n"));

        let file = repo.read_file_at_ref("main", "src/lib.rs").unwrap();
        assert_eq!(file.content, b"pub fn f() {}\n");
        assert_eq!(file.size, 14);
        assert_eq!(file.mode, FileMode::Regular);

        let log = repo.refs().read_reflog("refs/heads/main", 1).unwrap();
        assert!(log[0].message.starts_with("commit (initial):"));
    }

    #[test]
    fn test_read_file_errors() {
        let (_tmp, repo) = setup();
        commit_files(&repo, "main", &[("dir/file.txt", "x"), ("top.txt", "y")], 1);

        assert!(matches!(
            repo.read_file_at_ref("main", "dir"),
            Err(Error::IsADirectory { .. })
        ));
        assert!(matches!(
            repo.read_file_at_ref("main", "dir/missing.txt"),
            Err(Error::PathNotFound { .. })
        ));
        assert!(matches!(
            repo.read_file_at_ref("main", "top.txt/inner"),
            Err(Error::PathNotFound { .. })
        ));
        assert!(matches!(
            repo.read_file_at_ref("nope", "top.txt"),
            Err(Error::RefNotFound { .. })
        ));
    }

    #[test]
    fn test_list_tree_at_ref() {
        let (_tmp, repo) = setup();
        commit_files(&repo, "main", &[("dir/b.txt", "b"), ("dir/a.txt", "a"), ("z.txt", "z")], 1);

        let root: Vec<String> = repo
            .list_tree_at_ref("main", "")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(root, vec!["dir", "z.txt"]);

        let dir: Vec<String> = repo
            .list_tree_at_ref("main", "dir/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(dir, vec!["a.txt", "b.txt"]);
        assert!(repo.list_tree_at_ref("main", "z.txt").is_err());
    }

    #[test]
    fn test_commit_reuses_untouched_subtrees() {
        let (_tmp, repo) = setup();
        let first = commit_files(&repo, "main", &[("a/x.txt", "1"), ("b/y.txt", "2")], 1);
        let second = commit_files(&repo, "main", &[("a/x.txt", "changed")], 2);

        let t1 = repo.objects().read_tree(&repo.objects().read_commit(&first).unwrap().tree).unwrap();
        let t2 = repo.objects().read_tree(&repo.objects().read_commit(&second).unwrap().tree).unwrap();
        assert_eq!(t1.get("b").unwrap().id, t2.get("b").unwrap().id);
        assert_ne!(t1.get("a").unwrap().id, t2.get("a").unwrap().id);
        assert_eq!(repo.objects().read_commit(&second).unwrap().parents, vec![first]);
    }

    #[test]
    fn test_nothing_to_commit() {
        let (_tmp, repo) = setup();
        commit_files(&repo, "main", &[("a.txt", "same")], 1);

        let mut changes = Changeset::new();
        let blob = repo.objects().put_blob(b"same").unwrap();
        changes.write("a.txt", blob, FileMode::Regular).unwrap();
        assert!(matches!(
            repo.commit_changes("main", &changes, "noop", &sig(2), &sig(2)),
            Err(Error::NothingToCommit)
        ));

        let mut only_delete = Changeset::new();
        only_delete.delete("a.txt").unwrap();
        assert!(matches!(
            repo.commit_changes("fresh", &only_delete, "empty", &sig(2), &sig(2)),
            Err(Error::NothingToCommit)
        ));
    }

    #[test]
    fn test_deletions_prune_empty_directories() {
        let (_tmp, repo) = setup();
        commit_files(&repo, "main", &[("d/only.txt", "x"), ("keep.txt", "k")], 1);

        let mut changes = Changeset::new();
        changes.delete("d/only.txt").unwrap();
        repo.commit_changes("main", &changes, "rm", &sig(2), &sig(2)).unwrap();
        let names: Vec<String> = repo
            .list_tree_at_ref("main", "")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["keep.txt"]);
    }

    #[test]
    fn test_delete_under_file_is_ignored() {
        let (_tmp, repo) = setup();
        commit_files(&repo, "main", &[("f", "x"), ("g", "y")], 1);
        let mut changes = Changeset::new();
        changes.delete("f/inner").unwrap();
        changes.delete("g").unwrap();
        repo.commit_changes("main", &changes, "rm g", &sig(2), &sig(2)).unwrap();
        assert!(repo.read_file_at_ref("main", "f").is_ok());
    }

    #[test]
    fn test_file_and_directory_at_one_path_is_rejected() {
        let (_tmp, repo) = setup();
        let blob = repo.objects().put_blob(b"x").unwrap();
        let mut changes = Changeset::new();
        changes.write("a", blob, FileMode::Regular).unwrap();

        // Only a hand-edited stage can carry both.
        let mut value = serde_json::to_value(&changes).unwrap();
        let entry = value["changes"]["a"].clone();
        value["changes"]["a/b"] = entry;
        let conflicting: Changeset = serde_json::from_value(value).unwrap();
        assert_eq!(conflicting.len(), 2);

        assert!(matches!(
            repo.apply_changeset(None, &conflicting),
            Err(Error::InvalidPath { .. })
        ));
        assert!(matches!(
            repo.stage_content("a/b", b"y", FileMode::Regular)
                .and_then(|_| repo.stage_content("a", b"z", FileMode::Regular)),
            Err(Error::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_leftover_stage_is_dropped() {
        let (tmp, repo) = setup();
        repo.stage_content("a.txt", b"one", FileMode::Regular).unwrap();
        let first = repo.create_commit("first", &sig(1)).unwrap();

        // A commit that lost the race for the stage lock leaves its entries.
        repo.stage_content("a.txt", b"one", FileMode::Regular).unwrap();
        let lock = tmp.path().join("repo.git/grove/STAGE.lock");
        fs::write(&lock, "").unwrap();
        assert!(matches!(
            repo.create_commit("again", &sig(2)),
            Err(Error::NothingToCommit)
        ));
        assert_eq!(repo.staged().unwrap().len(), 1);

        fs::remove_file(&lock).unwrap();
        assert!(matches!(
            repo.create_commit("again", &sig(2)),
            Err(Error::NothingToCommit)
        ));
        assert!(repo.staged().unwrap().is_empty());
        assert_eq!(repo.resolve_ref("main").unwrap(), first);

        repo.stage_content("a.txt", b"two", FileMode::Regular).unwrap();
        let second = repo.create_commit("second", &sig(3)).unwrap();
        assert_eq!(repo.objects().read_commit(&second).unwrap().parents, vec![first]);
    }

    #[test]
    fn test_history_with_non_utf8_text() {
        let (_tmp, repo) = setup();
        let blob = repo.objects().put_blob(b"x").unwrap();
        let mut payload = b"100644 caf\xe9.txt\0".to_vec();
        payload.extend_from_slice(blob.as_bytes());
        let tree = repo.objects().put_tree(&Tree::decode(&"t", &payload).unwrap()).unwrap();

        let mut imported = Commit::new(tree, vec![], sig(1), sig(1), &b"caf\xe9\n"[..]);
        imported
            .extra_headers
            .push(("encoding".to_string(), "ISO-8859-1".to_string()));
        let root = repo.objects().put_commit(&imported).unwrap();
        repo.refs().create("refs/heads/main", root, &Reason::system("import")).unwrap();

        let log = repo.log("main", 10).unwrap();
        assert_eq!(log[0].1.summary(), "caf\u{e9}");
        assert_eq!(log[0].1, imported);

        let tip = commit_files(&repo, "main", &[("new.txt", "n")], 2);
        let tree = repo.objects().read_commit(&tip).unwrap().tree;
        let entries = repo.objects().read_tree(&tree).unwrap().into_entries();
        let names: Vec<&[u8]> = entries.iter().map(|e| e.name_bytes()).collect();
        assert_eq!(names, vec![&b"caf\xe9.txt"[..], &b"new.txt"[..]]);
    }

    #[test]
    fn test_stage_and_create_commit() {
        let (tmp, repo) = setup();
        let checkout = tmp.path().join("checkout");
        fs::create_dir_all(checkout.join("docs")).unwrap();
        fs::write(checkout.join("README.md"), "# hi\n").unwrap();
        fs::write(checkout.join("docs/guide.md"), "guide\n").unwrap();

        let staged = repo
            .stage_files(&checkout, &["README.md", "./docs//guide.md"])
            .unwrap();
        assert_eq!(staged, vec!["README.md", "docs/guide.md"]);

        let id = repo.create_commit("Initial commit", &sig(1)).unwrap();
        assert_eq!(repo.resolve_ref("HEAD").unwrap(), id);
        assert!(repo.staged().unwrap().is_empty());
        assert_eq!(
            repo.read_file_at_ref("main", "docs/guide.md").unwrap().content,
            b"guide\n"
        );

        // Removing a tracked file from the checkout stages a deletion.
        fs::remove_file(checkout.join("README.md")).unwrap();
        repo.stage_files(&checkout, &["README.md"]).unwrap();
        assert_eq!(repo.staged().unwrap().get("README.md"), Some(&Change::Delete));
        repo.create_commit("Remove readme", &sig(2)).unwrap();
        assert!(matches!(
            repo.read_file_at_ref("main", "README.md"),
            Err(Error::PathNotFound { .. })
        ));

        assert!(matches!(
            repo.stage_files(&checkout, &["never-existed.txt"]),
            Err(Error::FileNotFound { .. })
        ));
        assert!(matches!(
            repo.stage_files(&checkout, &["../outside"]),
            Err(Error::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_create_commit_with_empty_stage() {
        let (_tmp, repo) = setup();
        assert!(matches!(
            repo.create_commit("nothing", &sig(1)),
            Err(Error::NothingToCommit)
        ));
    }

    #[test]
    fn test_stage_content_and_unstage() {
        let (_tmp, repo) = setup();
        repo.stage_content("bin/run", b"#!/bin/sh\n", FileMode::Executable).unwrap();
        repo.stage_content("tmp.txt", b"t", FileMode::Regular).unwrap();
        repo.unstage(&["tmp.txt"]).unwrap();
        assert_eq!(repo.staged().unwrap().len(), 1);

        repo.create_commit("add script", &sig(1)).unwrap();
        let file = repo.read_file_at_ref("HEAD", "bin/run").unwrap();
        assert_eq!(file.mode, FileMode::Executable);

        repo.stage_deletion("bin/run").unwrap();
        repo.clear_stage().unwrap();
        assert!(repo.staged().unwrap().is_empty());
    }

    #[test]
    fn test_create_branch() {
        let (_tmp, repo) = setup();
        let tip = commit_files(&repo, "main", &[("a", "1")], 1);

        assert_eq!(repo.create_branch("feature/x", "main", false).unwrap(), tip);
        assert_eq!(repo.resolve_ref("feature/x").unwrap(), tip);
        assert_eq!(repo.default_branch().unwrap(), "main");

        assert!(matches!(
            repo.create_branch("feature/x", "main", false),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(matches!(
            repo.create_branch("other", "missing", false),
            Err(Error::SourceNotFound { .. })
        ));
        assert!(matches!(
            repo.create_branch("bad..name", "main", false),
            Err(Error::InvalidRefName { .. })
        ));

        repo.create_branch("dev", &tip.to_hex(), true).unwrap();
        assert_eq!(repo.default_branch().unwrap(), "dev");
        assert_eq!(repo.refs().list_branches().unwrap(), vec!["dev", "feature/x", "main"]);
    }

    #[test]
    fn test_set_default_branch() {
        let (_tmp, repo) = setup();
        commit_files(&repo, "main", &[("a", "1")], 1);
        repo.create_branch("release", "main", false).unwrap();
        repo.set_default_branch("release").unwrap();
        assert_eq!(repo.default_branch().unwrap(), "release");
        assert!(matches!(
            repo.set_default_branch("ghost"),
            Err(Error::RefNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_ref_peels_tags() {
        let (_tmp, repo) = setup();
        let tip = commit_files(&repo, "main", &[("a", "1")], 1);
        let tag = repo
            .objects()
            .put(&crate::object::Object::Tag(crate::object::Tag {
                object: tip,
                target_kind: ObjectKind::Commit,
                name: "v1.0".to_string(),
                tagger: Some(sig(2)),
                extra_headers: vec![],
                message: b"release\n".to_vec(),
            }))
            .unwrap();
        repo.refs()
            .create("refs/tags/v1.0", tag, &Reason::system("tag"))
            .unwrap();

        assert_eq!(repo.refs().resolve("v1.0").unwrap(), Some(tag));
        assert_eq!(repo.resolve_ref("v1.0").unwrap(), tip);
    }

    #[test]
    fn test_log_first_parent() {
        let (_tmp, repo) = setup();
        let c1 = commit_files(&repo, "main", &[("a", "1")], 1);
        let c2 = commit_files(&repo, "main", &[("a", "2")], 2);
        let c3 = commit_files(&repo, "main", &[("a", "3")], 3);

        let ids: Vec<ObjectId> = repo.log("main", 10).unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![c3, c2, c1]);
        assert_eq!(repo.log("main", 2).unwrap().len(), 2);
    }

    #[test]
    fn test_fork_copies_and_isolates() {
        let (tmp, repo) = setup();
        let tip = commit_files(&repo, "main", &[("src/a.rs", "a"), ("b.txt", "b")], 1);
        repo.create_branch("feature", "main", false).unwrap();
        repo.refs().create("refs/tags/v1", tip, &Reason::system("tag")).unwrap();

        let fork_path = tmp.path().join("fork.git");
        let summary = repo.fork(&fork_path).unwrap();
        assert_eq!(summary.default_branch, "main");
        assert_eq!(summary.branches, vec!["feature", "main"]);
        assert_eq!(summary.tags, vec!["v1"]);
        assert_eq!(summary.objects_copied, 5);

        let fork = Repository::open(&fork_path).unwrap();
        assert_eq!(fork.resolve_ref("main").unwrap(), tip);
        assert_eq!(fork.read_file_at_ref("main", "src/a.rs").unwrap().content, b"a");

        // Commits on either side stay on that side.
        let fork_tip = commit_files(&fork, "main", &[("fork-only", "f")], 2);
        let source_tip = commit_files(&repo, "main", &[("source-only", "s")], 3);
        assert_eq!(repo.resolve_ref("main").unwrap(), source_tip);
        assert_eq!(fork.resolve_ref("main").unwrap(), fork_tip);
        assert!(!repo.objects().contains(&fork_tip));
        assert!(!fork.objects().contains(&source_tip));
    }

    #[test]
    fn test_fork_into_existing_repository_fails() {
        let (tmp, repo) = setup();
        commit_files(&repo, "main", &[("a", "1")], 1);
        Repository::init(tmp.path().join("taken.git"), "main").unwrap();
        assert!(matches!(
            repo.fork(tmp.path().join("taken.git")),
            Err(Error::AlreadyExists { .. })
        ));
        // The existing repository is left intact.
        assert!(Repository::open(tmp.path().join("taken.git")).is_ok());
    }

    #[test]
    fn test_fork_refuses_non_empty_directory() {
        let (tmp, repo) = setup();
        commit_files(&repo, "main", &[("a", "1")], 1);
        let target = tmp.path().join("occupied");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("unrelated.txt"), "keep me").unwrap();

        assert!(matches!(repo.fork(&target), Err(Error::AlreadyExists { .. })));
        assert_eq!(fs::read_to_string(target.join("unrelated.txt")).unwrap(), "keep me");
        assert!(!target.join("HEAD").exists());
    }

    #[test]
    fn test_failed_fork_removes_only_what_it_created() {
        let (tmp, repo) = setup();
        let tip = commit_files(&repo, "main", &[("a", "1")], 1);
        let tree = repo.objects().read_commit(&tip).unwrap().tree;
        fs::remove_file(repo.objects().object_path(&tree)).unwrap();

        let fresh = tmp.path().join("fresh.git");
        assert!(matches!(repo.fork(&fresh), Err(Error::ObjectNotFound { .. })));
        assert!(!fresh.exists());

        let empty = tmp.path().join("empty.git");
        fs::create_dir(&empty).unwrap();
        assert!(repo.fork(&empty).is_err());
        assert!(empty.is_dir());
        assert_eq!(fs::read_dir(&empty).unwrap().count(), 0);
    }

    #[test]
    fn test_fork_into_empty_directory() {
        let (tmp, repo) = setup();
        let tip = commit_files(&repo, "main", &[("a", "1")], 1);
        let target = tmp.path().join("empty.git");
        fs::create_dir(&target).unwrap();
        repo.fork(&target).unwrap();
        assert_eq!(Repository::open(&target).unwrap().resolve_ref("main").unwrap(), tip);
    }

    #[test]
    fn test_fork_carries_reflogs() {
        let (tmp, repo) = setup();
        let tip = commit_files(&repo, "main", &[("a", "1")], 1);
        repo.create_branch("feature", "main", false).unwrap();

        let fork_path = tmp.path().join("fork.git");
        repo.fork(&fork_path).unwrap();
        let fork = Repository::open(&fork_path).unwrap();

        for name in ["refs/heads/main", "HEAD"] {
            let log = fork.refs().read_reflog(name, 10).unwrap();
            assert_eq!(log.len(), 2, "{}", name);
            assert!(log[0].message.starts_with("fork: from "), "{}", name);
            assert_eq!(log[1].message, "commit (initial): change");
            assert_eq!(log[1].new, tip);
        }
        let feature = fork.refs().read_reflog("refs/heads/feature", 10).unwrap();
        assert_eq!(feature.len(), 2);
        assert_eq!(feature[1].message, "branch: Created from main");
    }

    #[test]
    fn test_concurrent_commits_one_winner() {
        let (_tmp, repo) = setup();
        let base = commit_files(&repo, "main", &[("base.txt", "b")], 1);
        const WRITERS: usize = 6;
        let barrier = Barrier::new(WRITERS);

        let results: Vec<Result<ObjectId>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..WRITERS)
                .map(|n| {
                    let repo = &repo;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let mut changes = Changeset::new();
                        let blob = repo.objects().put_blob(format!("{}", n).as_bytes()).unwrap();
                        changes.write(&format!("file{}.txt", n), blob, FileMode::Regular).unwrap();
                        barrier.wait();
                        repo.commit_onto("main", Some(base), &changes, "race", &sig(2), &sig(2))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<&ObjectId> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(repo.resolve_ref("main").unwrap(), *winners[0]);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err, Error::NonFastForward { .. }));
            assert!(err.is_retriable());
        }
    }

    #[test]
    fn test_concurrent_commits_with_retry_lose_nothing() {
        let (_tmp, repo) = setup();
        commit_files(&repo, "main", &[("base.txt", "b")], 1);
        const WRITERS: usize = 6;

        std::thread::scope(|scope| {
            for n in 0..WRITERS {
                let repo = &repo;
                scope.spawn(move || {
                    let mut changes = Changeset::new();
                    let blob = repo.objects().put_blob(format!("{}", n).as_bytes()).unwrap();
                    changes.write(&format!("file{}.txt", n), blob, FileMode::Regular).unwrap();
                    loop {
                        match repo.commit_changes("main", &changes, "retry", &sig(2), &sig(2)) {
                            Ok(_) => break,
                            Err(err) if err.is_retriable() => continue,
                            Err(err) => panic!("unexpected error: {}", err),
                        }
                    }
                });
            }
        });

        for n in 0..WRITERS {
            let file = repo.read_file_at_ref("main", &format!("file{}.txt", n)).unwrap();
            assert_eq!(file.content, format!("{}", n).as_bytes());
        }
        assert_eq!(repo.log("main", 100).unwrap().len(), WRITERS + 1);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Property 1: one changeset and the same changes split over two
        /// commits produce the same tree.
        #[test]
        fn prop_split_commits_same_tree(
            files in prop::collection::btree_map("[a-c]/[a-d]\\.txt|[e-f]\\.txt", "[a-z]{0,8}", 2..10),
            split in 1usize..9,
        ) {
            let (_tmp, repo) = setup();
            let ids: Vec<(String, ObjectId)> = files
                .iter()
                .map(|(p, c)| (p.clone(), repo.objects().put_blob(c.as_bytes()).unwrap()))
                .collect();
            let split = split.min(ids.len() - 1);

            let mut all = Changeset::new();
            for (path, id) in &ids {
                all.write(path, *id, FileMode::Regular)?;
            }
            let mut first = Changeset::new();
            for (path, id) in &ids[..split] {
                first.write(path, *id, FileMode::Regular)?;
            }
            let mut second = Changeset::new();
            for (path, id) in &ids[split..] {
                second.write(path, *id, FileMode::Regular)?;
            }

            let at_once = repo.apply_changeset(None, &all)?;
            let halfway = repo.apply_changeset(None, &first)?;
            prop_assert_eq!(repo.apply_changeset(Some(halfway), &second)?, at_once);
        }
    }
}
