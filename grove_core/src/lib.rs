//! # Grove Core
//!
//! A storage engine for bare Git repositories, written against the on-disk
//! format directly.
//!
//! Objects are zlib-compressed loose objects addressed by SHA-1 and are
//! byte-compatible with Git. Refs are plain files updated by compare-and-swap
//! under `<ref>.lock` files, with a reflog for every transition. On top of the
//! two stores sit branch management, a staging area, commit construction,
//! repository forking and a native three-way merge engine.
//!
//! ## Features
//!
//! - Content-addressed object store with hash verification on every read
//! - Atomic, lock-protected ref updates; concurrent writers get a retriable error
//! - Commits built from staged changes, reusing unchanged subtrees
//! - Merge, squash and rebase integration with full merge-base search
//!
//! ## Example
//!
//! ```no_run
//! use grove_core::{FileMode, MergeOptions, MergeStrategy, Repository, Signature};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let repo = Repository::init("./repos/alice/demo.git", "main")?;
//! let alice = Signature::now("Alice", "alice@example.com");
//!
//! repo.stage_content("README.md", b"# demo\n", FileMode::Regular)?;
//! repo.create_commit("Initial commit", &alice)?;
//!
//! repo.create_branch("feature", "main", false)?;
//! let check = repo.check_mergeability("feature", "main")?;
//! if check.can_merge {
//!     let options = MergeOptions {
//!         committer: alice.clone(),
//!         strategy: MergeStrategy::Rebase,
//!     };
//!     repo.merge_pull_request("feature", "main", &options)?;
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod hash;
mod layout;
mod lockfile;
mod merge;
mod object;
mod reachable;
mod reflog;
mod refs;
mod repo;
mod stage;
mod store;
mod tree;

pub use config::{DEFAULT_COMPRESSION, RepoConfig};
pub use error::{Error, Result};
pub use hash::{HEX_LEN, ObjectId};
pub use layout::RepoLayout;
pub use merge::{
    MergeKind, MergeMethod, MergeOptions, MergeOutcome, MergeStrategy, Mergeability,
    default_merge_message,
};
pub use object::{Commit, Object, ObjectKind, Signature, Tag};
pub use reflog::{Reason, ReflogEntry};
pub use refs::{HEADS, RefStore, TAGS, branch_ref, check_ref_name, tag_ref};
pub use repo::{FileAtRef, ForkSummary, Repository, empty_tree_id};
pub use stage::{Change, Changeset, normalize_path};
pub use store::ObjectStore;
pub use tree::{FileMode, Tree, TreeEntry};
