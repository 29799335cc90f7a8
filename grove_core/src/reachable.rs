//! Reachability walk over the object graph.

use crate::error::Result;
use crate::hash::ObjectId;
use crate::object::{Commit, ObjectKind, Tag};
use crate::store::ObjectStore;
use crate::tree::{FileMode, Tree};
use std::collections::HashSet;

impl ObjectStore {
    /// Every object reachable from `roots`: commits, their trees and blobs,
    /// parents, and tag targets. Gitlink entries name commits of another
    /// repository and are not followed.
    ///
    /// Each id appears once, in visit order. A missing object is an error.
    pub fn reachable_from(
        &self,
        roots: impl IntoIterator<Item = ObjectId>,
    ) -> Result<Vec<ObjectId>> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<ObjectId> = roots.into_iter().collect();

        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            order.push(id);

            let (kind, payload) = self.get_raw(&id)?;
            match kind {
                ObjectKind::Blob => {}
                ObjectKind::Tree => {
                    for entry in Tree::decode(&id, &payload)?.entries() {
                        if entry.mode != FileMode::Gitlink && !seen.contains(&entry.id) {
                            stack.push(entry.id);
                        }
                    }
                }
                ObjectKind::Commit => {
                    let commit = Commit::decode(&id, &payload)?;
                    stack.extend(commit.parents.iter().filter(|p| !seen.contains(*p)));
                    stack.push(commit.tree);
                }
                ObjectKind::Tag => stack.push(Tag::decode(&id, &payload)?.object),
            }
        }

        Ok(order)
    }
}
