//! Reference storage.
//!
//! Loose refs are files under `refs/` holding `<hex>\n`; `HEAD` may instead
//! hold `ref: <target>\n`. `packed-refs` is consulted when no loose file
//! exists. Every write takes Git's per-ref lock: `<ref>.lock` is created
//! exclusively, filled, then renamed over the ref. A held lock is reported as
//! a conflict instead of being waited on.

use crate::error::{Error, Result};
use crate::hash::{HEX_LEN, ObjectId};
use crate::lockfile::LockFile;
use crate::reflog::{Reason, Reflog, ReflogEntry};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix of branch refs.
pub const HEADS: &str = "refs/heads/";
/// Prefix of tag refs.
pub const TAGS: &str = "refs/tags/";

/// Symbolic indirection is followed at most this many times.
const MAX_SYMREF_DEPTH: usize = 5;

/// Attempts at `packed-refs.lock`, `PACKED_LOCK_BACKOFF` apart.
const PACKED_LOCK_ATTEMPTS: u32 = 20;
const PACKED_LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// Full ref name of a branch.
pub fn branch_ref(branch: &str) -> String {
    if branch.starts_with(HEADS) {
        branch.to_string()
    } else {
        format!("{}{}", HEADS, branch)
    }
}

/// Full ref name of a tag.
pub fn tag_ref(tag: &str) -> String {
    if tag.starts_with(TAGS) {
        tag.to_string()
    } else {
        format!("{}{}", TAGS, tag)
    }
}

/// Check a ref name against Git's `check-ref-format` rules.
pub fn check_ref_name(name: &str) -> Result<()> {
    let reject = |reason: &str| Err(Error::invalid_ref_name(name, reason));

    if name.is_empty() {
        return reject("empty");
    }
    if name == "@" {
        return reject("'@' alone is reserved");
    }
    if name.starts_with('/') || name.ends_with('/') {
        return reject("leading or trailing '/'");
    }
    if name.ends_with('.') {
        return reject("trailing '.'");
    }
    if name.contains("..") {
        return reject("contains '..'");
    }
    if name.contains("@{") {
        return reject("contains '@{'");
    }
    if name.contains("//") {
        return reject("contains '//'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(Error::invalid_ref_name(
            name,
            format!("contains forbidden character {:?}", c),
        ));
    }
    for component in name.split('/') {
        if component.starts_with('.') {
            return reject("component starts with '.'");
        }
        if component.ends_with(".lock") {
            return reject("component ends with '.lock'");
        }
    }
    Ok(())
}

/// Names the store may write: `HEAD` or anything under `refs/`.
fn check_writable(name: &str) -> Result<()> {
    check_ref_name(name)?;
    if name != "HEAD" && !name.starts_with("refs/") {
        return Err(Error::invalid_ref_name(name, "must be HEAD or start with refs/"));
    }
    Ok(())
}

/// Raw content of a ref file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RefValue {
    Direct(ObjectId),
    Symbolic(String),
}

impl RefValue {
    fn parse(name: &str, text: &str) -> Result<Self> {
        let text = text.trim_end();
        if let Some(target) = text.strip_prefix("ref:") {
            return Ok(RefValue::Symbolic(target.trim().to_string()));
        }
        ObjectId::from_hex(text)
            .map(RefValue::Direct)
            .map_err(|_| Error::invalid_ref_name(name, format!("unreadable ref content {:?}", text)))
    }

    fn render(&self) -> String {
        match self {
            RefValue::Direct(id) => format!("{}\n", id),
            RefValue::Symbolic(target) => format!("ref: {}\n", target),
        }
    }
}

/// Reference manager of one repository.
#[derive(Debug, Clone)]
pub struct RefStore {
    git_dir: PathBuf,
    reflog: Reflog,
}

impl RefStore {
    /// Refs of the repository at `git_dir`.
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        let git_dir = git_dir.into();
        let reflog = Reflog::new(git_dir.join("logs"));
        Self { git_dir, reflog }
    }

    /// Reflogs of this repository.
    pub fn reflog(&self) -> &Reflog {
        &self.reflog
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.git_dir.join(name)
    }

    fn packed_refs_path(&self) -> PathBuf {
        self.git_dir.join("packed-refs")
    }

    /// Read a loose ref file without following it.
    fn read_loose(&self, name: &str) -> Result<Option<RefValue>> {
        let path = self.ref_path(name);
        match fs::read_to_string(&path) {
            Ok(text) => RefValue::parse(name, &text).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            // A directory (or a file where a parent directory should be)
            // means there is no ref by this name.
            Err(_) if !path.is_file() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Parse `packed-refs`. Peeled (`^`) lines and comments are skipped.
    fn read_packed(&self) -> Result<BTreeMap<String, ObjectId>> {
        let Some(text) = read_optional(&self.packed_refs_path())? else {
            return Ok(BTreeMap::new());
        };

        let mut refs = BTreeMap::new();
        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') || line.starts_with('^') {
                continue;
            }
            if let Some((hex, name)) = line.split_once(' ')
                && let Ok(id) = ObjectId::from_hex(hex)
            {
                refs.insert(name.trim().to_string(), id);
            }
        }
        Ok(refs)
    }

    /// Value of `name` itself: loose file first, then `packed-refs`.
    fn read_value(&self, name: &str) -> Result<Option<RefValue>> {
        if let Some(value) = self.read_loose(name)? {
            return Ok(Some(value));
        }
        Ok(self.read_packed()?.remove(name).map(RefValue::Direct))
    }

    /// Follow symbolic refs from `name` to the ref that holds an id.
    ///
    /// Returns the final name and its id, if any.
    fn peel_symbolic(&self, name: &str) -> Result<(String, Option<ObjectId>)> {
        let mut current = name.to_string();
        for _ in 0..MAX_SYMREF_DEPTH {
            match self.read_value(&current)? {
                Some(RefValue::Symbolic(target)) => {
                    check_ref_name(&target)?;
                    current = target;
                }
                Some(RefValue::Direct(id)) => return Ok((current, Some(id))),
                None => return Ok((current, None)),
            }
        }
        Err(Error::invalid_ref_name(name, "symbolic ref chain too deep"))
    }

    /// Read the id of a fully-qualified ref (or `HEAD`), following symbolic refs.
    pub fn read(&self, name: &str) -> Result<Option<ObjectId>> {
        check_ref_name(name)?;
        Ok(self.peel_symbolic(name)?.1)
    }

    /// Resolve a user-supplied name to an id.
    ///
    /// Accepts `HEAD`, full ref names, short branch/tag names (branches win)
    /// and 40-hex ids. Returns `None` if nothing matches.
    pub fn resolve(&self, name: &str) -> Result<Option<ObjectId>> {
        if name.len() == HEX_LEN
            && name.bytes().all(|b| b.is_ascii_hexdigit())
            && let Ok(id) = ObjectId::from_hex(name)
        {
            return Ok(Some(id));
        }
        check_ref_name(name)?;

        let candidates: Vec<String> = if name == "HEAD" || name.starts_with("refs/") {
            vec![name.to_string()]
        } else {
            vec![branch_ref(name), tag_ref(name)]
        };

        for candidate in candidates {
            if let Some(id) = self.peel_symbolic(&candidate)?.1 {
                debug!(name, resolved = %candidate, id = %id, "resolved ref");
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    /// Target of a symbolic ref, or `None` if `name` is direct or absent.
    pub fn read_symbolic(&self, name: &str) -> Result<Option<String>> {
        check_ref_name(name)?;
        match self.read_loose(name)? {
            Some(RefValue::Symbolic(target)) => Ok(Some(target)),
            _ => Ok(None),
        }
    }

    /// Point a symbolic ref (normally `HEAD`) at `target`.
    pub fn set_symbolic(&self, name: &str, target: &str, reason: &Reason) -> Result<()> {
        check_writable(name)?;
        check_writable(target)?;

        let lock = LockFile::acquire(&self.ref_path(name))?.ok_or_else(|| {
            warn!(name, "ref lock held by another writer");
            Error::ref_locked(name)
        })?;
        let old = self.peel_symbolic(name)?.1;
        let new = self.peel_symbolic(target)?.1;
        lock.commit(RefValue::Symbolic(target.to_string()).render().as_bytes())?;
        if let Some(new) = new {
            self.reflog.append(
                name,
                &ReflogEntry {
                    old: old.unwrap_or(ObjectId::ZERO),
                    new,
                    who: reason.who.clone(),
                    message: reason.message.clone(),
                },
            )?;
        }
        info!(name, target, reason = %reason.message, "set symbolic ref");
        Ok(())
    }

    /// All refs under `prefix` (e.g. `refs/heads/`), loose and packed, sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>> {
        let mut refs = BTreeMap::new();
        for (name, id) in self.read_packed()? {
            if name.starts_with(prefix) {
                refs.insert(name, id);
            }
        }

        let mut loose = Vec::new();
        collect_loose(&self.git_dir, &self.ref_path(prefix), &mut loose)?;
        for name in loose {
            if !name.starts_with(prefix) {
                continue;
            }
            match self.read_loose(&name) {
                Ok(Some(RefValue::Direct(id))) => {
                    refs.insert(name, id);
                }
                Ok(Some(RefValue::Symbolic(_))) => {
                    if let (_, Some(id)) = self.peel_symbolic(&name)? {
                        refs.insert(name, id);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(name = %name, error = %err, "skipping unreadable ref"),
            }
        }

        Ok(refs.into_iter().collect())
    }

    /// Branch names (without `refs/heads/`), sorted.
    pub fn list_branches(&self) -> Result<Vec<String>> {
        Ok(self
            .list(HEADS)?
            .into_iter()
            .map(|(name, _)| name[HEADS.len()..].to_string())
            .collect())
    }

    /// Tag names (without `refs/tags/`), sorted.
    pub fn list_tags(&self) -> Result<Vec<String>> {
        Ok(self
            .list(TAGS)?
            .into_iter()
            .map(|(name, _)| name[TAGS.len()..].to_string())
            .collect())
    }

    /// Create `name` at `id`; fails with `AlreadyExists` if it exists.
    pub fn create(&self, name: &str, id: ObjectId, reason: &Reason) -> Result<()> {
        match self.transition(name, Some(id), None, reason) {
            Err(Error::RefConflict { actual, .. }) if actual != "(locked)" => {
                Err(Error::already_exists(name))
            }
            other => other,
        }
    }

    /// Compare-and-swap `name` from `expected` (`None`: must not exist) to `new`.
    pub fn update(
        &self,
        name: &str,
        new: ObjectId,
        expected: Option<ObjectId>,
        reason: &Reason,
    ) -> Result<()> {
        self.transition(name, Some(new), expected, reason)
    }

    /// Delete `name` if it still points at `expected`.
    pub fn delete(&self, name: &str, expected: ObjectId, reason: &Reason) -> Result<()> {
        check_writable(name)?;
        if self.peel_symbolic(name)?.1.is_none() {
            return Err(Error::ref_not_found(name));
        }
        self.transition(name, None, Some(expected), reason)
    }

    /// Most recent reflog entries of `name`, newest first.
    pub fn read_reflog(&self, name: &str, limit: usize) -> Result<Vec<ReflogEntry>> {
        check_ref_name(name)?;
        self.reflog.read_recent(name, limit)
    }

    /// Locked compare-and-swap. `new = None` deletes.
    fn transition(
        &self,
        name: &str,
        new: Option<ObjectId>,
        expected: Option<ObjectId>,
        reason: &Reason,
    ) -> Result<()> {
        check_writable(name)?;
        // Writes through HEAD land on the branch it points at.
        let (name, _) = self.peel_symbolic(name)?;
        let name = name.as_str();
        let path = self.ref_path(name);
        self.check_hierarchy(name, &path)?;

        let lock = LockFile::acquire(&path)?.ok_or_else(|| {
            warn!(name, "ref lock held by another writer");
            Error::ref_locked(name)
        })?;

        // Read under the lock so the comparison is linearized.
        let current = match self.read_value(name)? {
            Some(RefValue::Direct(id)) => Some(id),
            Some(RefValue::Symbolic(_)) => {
                return Err(Error::invalid_ref_name(name, "is a symbolic ref"));
            }
            None => None,
        };
        if current != expected {
            debug!(name, ?expected, ?current, "ref compare-and-swap mismatch");
            return Err(Error::ref_conflict(name, expected, current));
        }

        match new {
            Some(id) => lock.commit(RefValue::Direct(id).render().as_bytes())?,
            None => {
                self.remove_from_packed(name)?;
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                drop(lock);
                self.prune_empty_dirs(&path);
            }
        }

        let entry = ReflogEntry {
            old: current.unwrap_or(ObjectId::ZERO),
            new: new.unwrap_or(ObjectId::ZERO),
            who: reason.who.clone(),
            message: reason.message.clone(),
        };
        self.reflog.append(name, &entry)?;
        // Moving the branch HEAD points at moves HEAD too.
        if new.is_some() && name != "HEAD" && self.head_target().as_deref() == Some(name) {
            self.reflog.append("HEAD", &entry)?;
        }
        info!(
            name,
            old = %current.map(|id| id.short()).unwrap_or_default(),
            new = %new.map(|id| id.short()).unwrap_or_default(),
            reason = %reason.message,
            "ref updated"
        );
        Ok(())
    }

    /// Ref HEAD finally points at, if HEAD is symbolic and readable.
    fn head_target(&self) -> Option<String> {
        match self.peel_symbolic("HEAD") {
            Ok((target, _)) if target != "HEAD" => Some(target),
            _ => None,
        }
    }

    /// Reject a name that would nest under, or shadow, an existing ref.
    fn check_hierarchy(&self, name: &str, path: &Path) -> Result<()> {
        if path.is_dir() {
            return Err(Error::invalid_ref_name(name, "a ref hierarchy exists under this name"));
        }
        let mut ancestor = path.parent();
        while let Some(dir) = ancestor {
            if dir == self.git_dir {
                break;
            }
            if dir.is_file() {
                return Err(Error::invalid_ref_name(name, "a parent name is already a ref"));
            }
            ancestor = dir.parent();
        }
        Ok(())
    }

    /// Drop `name` from `packed-refs` under `packed-refs.lock`.
    ///
    /// The file is re-read once the lock is held, so concurrent removals of
    /// other names are not lost.
    fn remove_from_packed(&self, name: &str) -> Result<()> {
        let path = self.packed_refs_path();
        let suffix = format!(" {}", name);
        let mentions = |text: &str| {
            text.lines()
                .any(|line| !line.starts_with('#') && line.ends_with(&suffix))
        };

        // Nothing packs refs while we run, so an absent entry stays absent.
        match read_optional(&path)? {
            Some(text) if mentions(&text) => {}
            _ => return Ok(()),
        }

        let lock = self.lock_packed()?;
        let text = match read_optional(&path)? {
            Some(text) if mentions(&text) => text,
            _ => return Ok(()),
        };

        let mut out = String::new();
        let mut skipping_peel = false;
        for line in text.lines() {
            if line.starts_with('^') {
                if !skipping_peel {
                    out.push_str(line);
                    out.push('\n');
                }
                continue;
            }
            skipping_peel = !line.starts_with('#') && line.ends_with(&suffix);
            if !skipping_peel {
                out.push_str(line);
                out.push('\n');
            }
        }
        lock.commit(out.as_bytes())
    }

    /// Take `packed-refs.lock`. Every packed deletion shares this one lock,
    /// so a held lock is retried briefly before it counts as a conflict.
    fn lock_packed(&self) -> Result<LockFile> {
        let path = self.packed_refs_path();
        for attempt in 0..PACKED_LOCK_ATTEMPTS {
            if let Some(lock) = LockFile::acquire(&path)? {
                return Ok(lock);
            }
            debug!(attempt, "packed-refs lock busy");
            thread::sleep(PACKED_LOCK_BACKOFF);
        }
        warn!("packed-refs lock held by another writer");
        Err(Error::ref_locked("packed-refs"))
    }

    /// Remove now-empty directories between a deleted ref and `refs/`.
    fn prune_empty_dirs(&self, path: &Path) {
        let stop = self.git_dir.join("refs");
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == stop || d.ends_with("refs/heads") || d.ends_with("refs/tags") {
                break;
            }
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// Contents of `path`, or `None` if it does not exist.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Collect loose ref names under `dir`, relative to `git_dir`, skipping locks.
fn collect_loose(git_dir: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    // `prefix` may name a partial component, e.g. `refs/heads/fea`.
    let dir = if dir.is_dir() {
        dir.to_path_buf()
    } else {
        match dir.parent() {
            Some(parent) if parent.is_dir() => parent.to_path_buf(),
            _ => return Ok(()),
        }
    };

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_loose(git_dir, &path, out)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(git_dir) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !name.ends_with(".lock") {
                out.push(name);
            }
        }
    }
    Ok(())
}
