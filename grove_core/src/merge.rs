//! Merge engine: merge bases, ahead/behind counts, three-way tree merges and
//! the merge, squash and rebase strategies.
//!
//! Nothing here touches a ref until the very end of a merge, and then only
//! the target branch, once, by compare-and-swap. A conflict at any point
//! leaves the repository's refs exactly as they were; objects written along
//! the way are unreferenced and harmless.

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{Commit, Object, Signature};
use crate::reflog::Reason;
use crate::refs::branch_ref;
use crate::repo::Repository;
use crate::store::ObjectStore;
use crate::tree::{FileMode, Tree, TreeEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info};

/// How a pull request is integrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        })
    }
}

/// Strategy plus the data it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Merge commit with parents `[target, source]`, or a fast-forward.
    Merge { message: String },
    /// One commit on top of the target holding the merged tree.
    Squash { message: String },
    /// Replay source-only commits onto the target; each keeps its message.
    Rebase,
}

impl MergeStrategy {
    pub fn method(&self) -> MergeMethod {
        match self {
            MergeStrategy::Merge { .. } => MergeMethod::Merge,
            MergeStrategy::Squash { .. } => MergeMethod::Squash,
            MergeStrategy::Rebase => MergeMethod::Rebase,
        }
    }
}

/// Options of one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Committer of every commit the merge creates (and author of merge and
    /// squash commits).
    pub committer: Signature,
    pub strategy: MergeStrategy,
}

/// What a merge did to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    /// Source was already contained in the target; nothing changed.
    AlreadyMerged,
    /// Target moved to the source tip.
    FastForward,
    MergeCommit,
    Squashed,
    Rebased,
}

/// Result of a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// New tip of the target branch.
    pub sha: ObjectId,
    pub kind: MergeKind,
}

/// Result of a mergeability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mergeability {
    pub can_merge: bool,
    /// Conflicting paths, sorted.
    pub conflicts: Vec<String>,
    /// Commits reachable from the target but not the source.
    pub behind_by: usize,
    /// Commits reachable from the source but not the target.
    pub ahead_by: usize,
    pub merge_base: Option<ObjectId>,
    pub fast_forward: bool,
}

/// Default commit message for merging pull request `number`.
pub fn default_merge_message(
    number: u64,
    title: &str,
    source: &str,
    target: &str,
    method: MergeMethod,
) -> String {
    match method {
        MergeMethod::Merge => format!(
            "Merge pull request #{} from {} into {}\n\n{}\n",
            number, source, target, title
        ),
        MergeMethod::Squash => format!(
            "{} (#{})\n\nSquashed commits from {} into {}\n",
            title, number, source, target
        ),
        MergeMethod::Rebase => format!(
            "Rebase pull request #{} from {} onto {}\n\n{}\n",
            number, source, target, title
        ),
    }
}

/// Per-attempt cache of parsed commits, shared by the graph walks.
struct MergeContext<'r> {
    store: &'r ObjectStore,
    commits: HashMap<ObjectId, Commit>,
}

impl<'r> MergeContext<'r> {
    fn new(store: &'r ObjectStore) -> Self {
        Self {
            store,
            commits: HashMap::new(),
        }
    }

    fn commit(&mut self, id: ObjectId) -> Result<&Commit> {
        if !self.commits.contains_key(&id) {
            let commit = self.store.read_commit(&id)?;
            self.commits.insert(id, commit);
        }
        self.commits
            .get(&id)
            .ok_or_else(|| Error::object_not_found(id))
    }

    fn parents(&mut self, id: ObjectId) -> Result<Vec<ObjectId>> {
        Ok(self.commit(id)?.parents.clone())
    }

    /// `tip` and everything reachable from it.
    fn ancestors(&mut self, tip: ObjectId) -> Result<HashSet<ObjectId>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([tip]);
        while let Some(id) = queue.pop_front() {
            if seen.insert(id) {
                queue.extend(self.parents(id)?);
            }
        }
        Ok(seen)
    }

    /// Best common ancestors: common ancestors that are not parents of other
    /// common ancestors.
    fn merge_bases(
        &mut self,
        a_ancestors: &HashSet<ObjectId>,
        b_ancestors: &HashSet<ObjectId>,
    ) -> Result<Vec<ObjectId>> {
        let common: Vec<ObjectId> = a_ancestors.intersection(b_ancestors).copied().collect();
        let mut dominated = HashSet::new();
        for id in &common {
            dominated.extend(self.parents(*id)?);
        }
        let mut bases: Vec<ObjectId> = common
            .into_iter()
            .filter(|id| !dominated.contains(id))
            .collect();
        bases.sort();
        Ok(bases)
    }

    /// Pick one base: latest committer time, ties broken by id.
    fn pick_base(&mut self, bases: &[ObjectId]) -> Result<Option<ObjectId>> {
        let mut best: Option<(i64, ObjectId)> = None;
        for &id in bases {
            let key = (self.commit(id)?.committer.time, id);
            if best.is_none_or(|b| key > b) {
                best = Some(key);
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    fn tree_of(&mut self, id: ObjectId) -> Result<ObjectId> {
        Ok(self.commit(id)?.tree)
    }

    /// Source-only, non-merge commits with parents before children.
    fn commits_to_replay(
        &mut self,
        source: ObjectId,
        target_ancestors: &HashSet<ObjectId>,
    ) -> Result<Vec<ObjectId>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // (commit, parents already pushed)
        let mut stack = vec![(source, false)];
        while let Some((id, expanded)) = stack.pop() {
            if target_ancestors.contains(&id) {
                continue;
            }
            if expanded {
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            // Reverse so the first parent's history is emitted first.
            for parent in self.parents(id)?.into_iter().rev() {
                if !visited.contains(&parent) {
                    stack.push((parent, false));
                }
            }
        }

        let mut replay = Vec::with_capacity(order.len());
        for id in order {
            if !self.commit(id)?.is_merge() {
                replay.push(id);
            }
        }
        Ok(replay)
    }
}

/// Tip ids and graph facts shared by the check and the merge.
struct Analysis {
    source: ObjectId,
    target: ObjectId,
    base: Option<ObjectId>,
    ahead_by: usize,
    behind_by: usize,
    target_ancestors: HashSet<ObjectId>,
}

/// Three-way merge of trees, collecting conflicting paths.
struct TreeMerger<'s> {
    store: &'s ObjectStore,
    /// Write merged trees, or only compute their ids.
    write: bool,
    conflicts: BTreeSet<String>,
}

impl<'s> TreeMerger<'s> {
    fn new(store: &'s ObjectStore, write: bool) -> Self {
        Self {
            store,
            write,
            conflicts: BTreeSet::new(),
        }
    }

    /// Merge root trees. The result is only meaningful without conflicts.
    fn merge_roots(&mut self, base: ObjectId, ours: ObjectId, theirs: ObjectId) -> Result<ObjectId> {
        if ours == theirs || base == theirs {
            return Ok(ours);
        }
        if base == ours {
            return Ok(theirs);
        }
        match self.merge_trees(Some(base), ours, theirs, "")? {
            Some(id) => Ok(id),
            None => self.store_tree(&Tree::new()),
        }
    }

    fn read(&self, id: Option<ObjectId>) -> Result<Tree> {
        match id {
            Some(id) => self.store.read_tree(&id),
            None => Ok(Tree::new()),
        }
    }

    fn store_tree(&self, tree: &Tree) -> Result<ObjectId> {
        if self.write {
            self.store.put_tree(tree)
        } else {
            Ok(self.store.hash_only(&Object::Tree(tree.clone())))
        }
    }

    /// Merge one directory level; `None` means the merged directory is empty.
    fn merge_trees(
        &mut self,
        base: Option<ObjectId>,
        ours: ObjectId,
        theirs: ObjectId,
        prefix: &str,
    ) -> Result<Option<ObjectId>> {
        let base_tree = self.read(base)?;
        let our_tree = self.store.read_tree(&ours)?;
        let their_tree = self.store.read_tree(&theirs)?;

        // Keyed by bytes so names that are not UTF-8 stay distinct.
        let names: BTreeSet<&[u8]> = base_tree
            .entries()
            .iter()
            .chain(our_tree.entries())
            .chain(their_tree.entries())
            .map(|e| e.name_bytes())
            .collect();

        let mut merged = Tree::new();
        for name in names {
            let name_text = String::from_utf8_lossy(name);
            let path = if prefix.is_empty() {
                name_text.into_owned()
            } else {
                format!("{}/{}", prefix, name_text)
            };
            let b = base_tree.get_bytes(name);
            let o = our_tree.get_bytes(name);
            let t = their_tree.get_bytes(name);
            if let Some(entry) = self.merge_entry(&path, b, o, t)? {
                merged.insert(entry);
            }
        }

        if merged.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.store_tree(&merged)?))
    }

    fn merge_entry(
        &mut self,
        path: &str,
        b: Option<&TreeEntry>,
        o: Option<&TreeEntry>,
        t: Option<&TreeEntry>,
    ) -> Result<Option<TreeEntry>> {
        let same = |x: Option<&TreeEntry>, y: Option<&TreeEntry>| match (x, y) {
            (Some(x), Some(y)) => x.mode == y.mode && x.id == y.id,
            (None, None) => true,
            _ => false,
        };

        if same(o, t) || same(b, t) {
            return Ok(o.cloned());
        }
        if same(b, o) {
            return Ok(t.cloned());
        }

        match (b, o, t) {
            // Directory on both sides: merge inside it.
            (_, Some(o), Some(t)) if o.mode.is_tree() && t.mode.is_tree() => {
                let sub_base = b.filter(|b| b.mode.is_tree()).map(|b| b.id);
                Ok(self
                    .merge_trees(sub_base, o.id, t.id, path)?
                    .map(|id| o.retarget(FileMode::Directory, id)))
            }
            // File on all three sides: content and mode may have changed on
            // different sides.
            (Some(b), Some(o), Some(t))
                if !b.mode.is_tree() && !o.mode.is_tree() && !t.mode.is_tree() =>
            {
                let id = pick(b.id, o.id, t.id);
                let mode = pick(b.mode, o.mode, t.mode);
                match (id, mode) {
                    (Some(id), Some(mode)) => Ok(Some(o.retarget(mode, id))),
                    _ => self.conflict(path, Some(o)),
                }
            }
            _ => self.conflict(path, o),
        }
    }

    fn conflict(&mut self, path: &str, ours: Option<&TreeEntry>) -> Result<Option<TreeEntry>> {
        debug!(path, "merge conflict");
        self.conflicts.insert(path.to_string());
        Ok(ours.cloned())
    }

    fn into_conflicts(self) -> Vec<String> {
        self.conflicts.into_iter().collect()
    }
}

/// Three-way choice of one value: the side that changed wins.
fn pick<T: PartialEq + Copy>(base: T, ours: T, theirs: T) -> Option<T> {
    if ours == theirs || base == theirs {
        Some(ours)
    } else if base == ours {
        Some(theirs)
    } else {
        None
    }
}

impl Repository {
    fn analyze(
        &self,
        ctx: &mut MergeContext<'_>,
        source: ObjectId,
        target: ObjectId,
    ) -> Result<Analysis> {
        let source_ancestors = ctx.ancestors(source)?;
        let target_ancestors = ctx.ancestors(target)?;
        let bases = ctx.merge_bases(&source_ancestors, &target_ancestors)?;
        if bases.len() > 1 {
            debug!(count = bases.len(), "criss-cross history, several merge bases");
        }
        let base = ctx.pick_base(&bases)?;

        Ok(Analysis {
            source,
            target,
            base,
            ahead_by: source_ancestors.difference(&target_ancestors).count(),
            behind_by: target_ancestors.difference(&source_ancestors).count(),
            target_ancestors,
        })
    }

    fn resolve_source(&self, source: &str) -> Result<ObjectId> {
        match self.resolve_ref(source) {
            Err(Error::RefNotFound { .. }) | Err(Error::ObjectNotFound { .. }) => {
                Err(Error::SourceNotFound {
                    name: source.to_string(),
                })
            }
            other => other,
        }
    }

    fn resolve_target(&self, target: &str) -> Result<ObjectId> {
        match self.refs().read(&branch_ref(target))? {
            Some(id) => Ok(id),
            None => Err(Error::TargetNotFound {
                name: target.to_string(),
            }),
        }
    }

    /// Whether `source` merges cleanly into the branch `target`, without
    /// writing anything.
    pub fn check_mergeability(&self, source: &str, target: &str) -> Result<Mergeability> {
        let source_id = self.resolve_source(source)?;
        let target_id = self.resolve_target(target)?;
        let mut ctx = MergeContext::new(self.objects());
        let analysis = self.analyze(&mut ctx, source_id, target_id)?;

        let Some(base) = analysis.base else {
            return Ok(Mergeability {
                can_merge: false,
                conflicts: Vec::new(),
                behind_by: analysis.behind_by,
                ahead_by: analysis.ahead_by,
                merge_base: None,
                fast_forward: false,
            });
        };

        let fast_forward = base == target_id && source_id != target_id;
        let conflicts = if base == source_id || base == target_id {
            Vec::new()
        } else {
            let mut merger = TreeMerger::new(self.objects(), false);
            merger.merge_roots(
                ctx.tree_of(base)?,
                ctx.tree_of(target_id)?,
                ctx.tree_of(source_id)?,
            )?;
            merger.into_conflicts()
        };

        let result = Mergeability {
            can_merge: conflicts.is_empty(),
            conflicts,
            behind_by: analysis.behind_by,
            ahead_by: analysis.ahead_by,
            merge_base: Some(base),
            fast_forward,
        };
        info!(
            source,
            target,
            can_merge = result.can_merge,
            ahead_by = result.ahead_by,
            behind_by = result.behind_by,
            "checked mergeability"
        );
        Ok(result)
    }

    /// Integrate `source` into the branch `target`.
    ///
    /// The target ref moves at most once, by compare-and-swap against the tip
    /// read at the start; if it moved meanwhile the merge fails with
    /// `NonFastForward` and can be retried.
    pub fn merge_pull_request(
        &self,
        source: &str,
        target: &str,
        options: &MergeOptions,
    ) -> Result<MergeOutcome> {
        let source_id = self.resolve_source(source)?;
        let target_id = self.resolve_target(target)?;
        let mut ctx = MergeContext::new(self.objects());
        let analysis = self.analyze(&mut ctx, source_id, target_id)?;

        let Some(base) = analysis.base else {
            return Err(Error::UnrelatedHistories {
                source_ref: source.to_string(),
                target_ref: target.to_string(),
            });
        };

        if base == source_id {
            info!(source, target, "already merged");
            return Ok(MergeOutcome {
                sha: target_id,
                kind: MergeKind::AlreadyMerged,
            });
        }

        let outcome = match &options.strategy {
            MergeStrategy::Merge { .. } | MergeStrategy::Rebase if base == target_id => MergeOutcome {
                sha: source_id,
                kind: MergeKind::FastForward,
            },
            MergeStrategy::Merge { message } => {
                let tree = self.merged_tree(&mut ctx, base, target_id, source_id)?;
                let commit = Commit::new(
                    tree,
                    vec![target_id, source_id],
                    options.committer.clone(),
                    options.committer.clone(),
                    message.clone(),
                );
                MergeOutcome {
                    sha: self.objects().put_commit(&commit)?,
                    kind: MergeKind::MergeCommit,
                }
            }
            MergeStrategy::Squash { message } => {
                let tree = self.merged_tree(&mut ctx, base, target_id, source_id)?;
                if tree == ctx.tree_of(target_id)? {
                    return Err(Error::NothingToCommit);
                }
                let commit = Commit::new(
                    tree,
                    vec![target_id],
                    options.committer.clone(),
                    options.committer.clone(),
                    message.clone(),
                );
                MergeOutcome {
                    sha: self.objects().put_commit(&commit)?,
                    kind: MergeKind::Squashed,
                }
            }
            MergeStrategy::Rebase => {
                let tip = self.replay(&mut ctx, &analysis, &options.committer)?;
                if tip == target_id {
                    info!(source, target, "rebase left nothing to apply");
                    return Ok(MergeOutcome {
                        sha: target_id,
                        kind: MergeKind::AlreadyMerged,
                    });
                }
                MergeOutcome {
                    sha: tip,
                    kind: MergeKind::Rebased,
                }
            }
        };

        let reason = Reason::new(
            &options.committer,
            format!("merge {}: {:?}", source, outcome.kind),
        );
        match self
            .refs()
            .update(&branch_ref(target), outcome.sha, Some(analysis.target), &reason)
        {
            Ok(()) => {}
            Err(Error::RefConflict { .. }) => return Err(Error::non_fast_forward(target)),
            Err(err) => return Err(err),
        }

        info!(
            source,
            target,
            strategy = %options.strategy.method(),
            kind = ?outcome.kind,
            sha = %outcome.sha.short(),
            "merged"
        );
        Ok(outcome)
    }

    /// Write the three-way merge of the two tips' trees, or fail with the
    /// conflicting paths.
    fn merged_tree(
        &self,
        ctx: &mut MergeContext<'_>,
        base: ObjectId,
        ours: ObjectId,
        theirs: ObjectId,
    ) -> Result<ObjectId> {
        let mut merger = TreeMerger::new(self.objects(), true);
        let tree = merger.merge_roots(ctx.tree_of(base)?, ctx.tree_of(ours)?, ctx.tree_of(theirs)?)?;
        let conflicts = merger.into_conflicts();
        if !conflicts.is_empty() {
            return Err(Error::merge_conflict(conflicts));
        }
        Ok(tree)
    }

    /// Replay source-only commits onto the target tip, returning the new tip.
    ///
    /// Merge commits are skipped. A commit whose changes are already present
    /// upstream is dropped.
    fn replay(
        &self,
        ctx: &mut MergeContext<'_>,
        analysis: &Analysis,
        committer: &Signature,
    ) -> Result<ObjectId> {
        let mut onto = analysis.target;
        let mut onto_tree = ctx.tree_of(onto)?;

        for id in ctx.commits_to_replay(analysis.source, &analysis.target_ancestors)? {
            let original = ctx.commit(id)?.clone();
            let parent_tree = match original.parents.first() {
                Some(parent) => ctx.tree_of(*parent)?,
                None => self.objects().put_tree(&Tree::new())?,
            };

            let mut merger = TreeMerger::new(self.objects(), true);
            let tree = merger.merge_roots(parent_tree, onto_tree, original.tree)?;
            let conflicts = merger.into_conflicts();
            if !conflicts.is_empty() {
                debug!(commit = %id.short(), "rebase stopped on conflict");
                return Err(Error::merge_conflict(conflicts));
            }
            if tree == onto_tree {
                debug!(commit = %id.short(), "dropping commit already upstream");
                continue;
            }

            let mut rewritten = Commit::new(
                tree,
                vec![onto],
                original.author.clone(),
                committer.clone(),
                original.message.clone(),
            );
            // The message bytes stay in the original's encoding.
            rewritten.extra_headers = original
                .extra_headers
                .iter()
                .filter(|(key, _)| key == "encoding")
                .cloned()
                .collect();
            onto = self.objects().put_commit(&rewritten)?;
            onto_tree = tree;
            debug!(from = %id.short(), to = %onto.short(), "replayed commit");
        }
        Ok(onto)
    }
}
