//! Tree encoding and directory structure.
//!
//! A tree payload is a sequence of entries, each
//!
//! ```text
//! <octal mode> SP <name> NUL <20-byte raw id>
//! ```
//!
//! sorted the way Git sorts them: bytewise by name, except that a subtree
//! compares as if its name ended in `/`.

use crate::error::{Error, Result};
use crate::hash::{ID_SIZE, ObjectId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Entry mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    /// Regular file (`100644`).
    Regular,
    /// Executable file (`100755`).
    Executable,
    /// Symbolic link (`120000`); the blob holds the link target.
    Symlink,
    /// Subtree (`40000`).
    Directory,
    /// Submodule commit (`160000`).
    Gitlink,
}

impl FileMode {
    /// Numeric mode.
    pub fn bits(self) -> u32 {
        match self {
            FileMode::Regular => 0o100644,
            FileMode::Executable => 0o100755,
            FileMode::Symlink => 0o120000,
            FileMode::Directory => 0o040000,
            FileMode::Gitlink => 0o160000,
        }
    }

    /// Mode as written in tree payloads (octal, no leading zero).
    pub fn as_str(self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
            FileMode::Symlink => "120000",
            FileMode::Directory => "40000",
            FileMode::Gitlink => "160000",
        }
    }

    /// Parse an octal mode.
    ///
    /// Legacy file modes such as `100664` fold onto regular/executable by
    /// their execute bits.
    pub fn parse(text: &str) -> Option<Self> {
        if text.is_empty() || !text.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
            return None;
        }
        let bits = u32::from_str_radix(text, 8).ok()?;
        match bits & 0o170000 {
            0o040000 => Some(FileMode::Directory),
            0o120000 => Some(FileMode::Symlink),
            0o160000 => Some(FileMode::Gitlink),
            0o100000 if bits & 0o111 != 0 => Some(FileMode::Executable),
            0o100000 => Some(FileMode::Regular),
            _ => None,
        }
    }

    /// Whether entries of this mode point at a tree.
    pub fn is_tree(self) -> bool {
        self == FileMode::Directory
    }

    /// Whether entries of this mode point at a blob.
    pub fn is_blob(self) -> bool {
        matches!(
            self,
            FileMode::Regular | FileMode::Executable | FileMode::Symlink
        )
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}", self.bits())
    }
}

/// An entry in a tree (file, symlink, subdirectory or submodule).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub mode: FileMode,
    /// Entry name. A name stored as non-UTF-8 bytes shows U+FFFD here and
    /// keeps its bytes in `raw_name`.
    pub name: String,
    pub id: ObjectId,
    #[serde(skip)]
    raw_name: Option<Vec<u8>>,
}

impl TreeEntry {
    /// Create a new tree entry, validating the name.
    pub fn new(mode: FileMode, name: impl Into<String>, id: ObjectId) -> Result<Self> {
        let name = name.into();
        validate_entry_name(name.as_bytes())?;
        Ok(Self {
            mode,
            name,
            id,
            raw_name: None,
        })
    }

    /// Create an entry from name bytes as stored in a tree payload.
    pub fn from_name_bytes(mode: FileMode, name: &[u8], id: ObjectId) -> Result<Self> {
        validate_entry_name(name)?;
        let (name, raw_name) = match std::str::from_utf8(name) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (String::from_utf8_lossy(name).into_owned(), Some(name.to_vec())),
        };
        Ok(Self {
            mode,
            name,
            id,
            raw_name,
        })
    }

    /// Name bytes exactly as written to the tree.
    pub fn name_bytes(&self) -> &[u8] {
        self.raw_name.as_deref().unwrap_or(self.name.as_bytes())
    }

    /// Same name, new mode and target.
    pub fn retarget(&self, mode: FileMode, id: ObjectId) -> Self {
        Self {
            mode,
            id,
            ..self.clone()
        }
    }

    /// Encode the entry to bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.mode.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.name_bytes());
        buf.push(0);
        buf.extend_from_slice(self.id.as_bytes());
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    /// Git's canonical ordering: subtrees sort as `name/`.
    fn cmp(&self, other: &Self) -> Ordering {
        git_name_cmp(
            self.name_bytes(),
            self.mode.is_tree(),
            other.name_bytes(),
            other.mode.is_tree(),
        )
    }
}

/// Compare two entry names the way Git orders tree entries.
pub fn git_name_cmp(a: &[u8], a_is_tree: bool, b: &[u8], b_is_tree: bool) -> Ordering {
    let common = a.len().min(b.len());
    match a[..common].cmp(&b[..common]) {
        Ordering::Equal => {}
        other => return other,
    }
    let tail = |name: &[u8], is_tree: bool| -> u8 {
        if name.len() > common {
            name[common]
        } else if is_tree {
            b'/'
        } else {
            0
        }
    };
    tail(a, a_is_tree).cmp(&tail(b, b_is_tree))
}

fn validate_entry_name(name: &[u8]) -> Result<()> {
    let invalid = |reason: &str| Err(Error::invalid_path(String::from_utf8_lossy(name), reason));
    if name.is_empty() {
        return invalid("entry name cannot be empty");
    }
    if name == b"." || name == b".." {
        return invalid("entry name cannot be . or ..");
    }
    if name.contains(&b'/') {
        return invalid("entry name cannot contain '/'");
    }
    if name.contains(&0) {
        return invalid("entry name cannot contain NUL");
    }
    Ok(())
}

/// A tree object: entries in canonical order, names unique.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from entries in any order. A later entry replaces an
    /// earlier one with the same name.
    pub fn from_entries(entries: impl IntoIterator<Item = TreeEntry>) -> Self {
        let mut tree = Self::new();
        for entry in entries {
            tree.insert(entry);
        }
        tree
    }

    /// Entries in canonical order.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Consume into entries.
    pub fn into_entries(self) -> Vec<TreeEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.get_bytes(name.as_bytes())
    }

    /// Look up an entry by its name bytes.
    pub fn get_bytes(&self, name: &[u8]) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name_bytes() == name)
    }

    /// Insert or replace an entry, keeping canonical order.
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.retain(|e| e.name_bytes() != entry.name_bytes());
        let pos = self
            .entries
            .binary_search(&entry)
            .unwrap_or_else(|pos| pos);
        self.entries.insert(pos, entry);
    }

    /// Remove an entry by name, returning it.
    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.name_bytes() == name.as_bytes())?;
        Some(self.entries.remove(pos))
    }

    /// Encode the tree payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * 48);
        for entry in &self.entries {
            entry.encode_into(&mut buf);
        }
        buf
    }

    /// Decode a tree payload, rejecting unsorted or duplicate entries.
    pub fn decode(id: &dyn fmt::Display, data: &[u8]) -> Result<Self> {
        let mut entries: Vec<TreeEntry> = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let space = data[pos..]
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| Error::corrupt_object(id, "tree entry without mode"))?;
            let mode_text = std::str::from_utf8(&data[pos..pos + space])
                .map_err(|_| Error::corrupt_object(id, "tree mode is not UTF-8"))?;
            let mode = FileMode::parse(mode_text).ok_or_else(|| {
                Error::corrupt_object(id, format!("invalid tree entry mode {:?}", mode_text))
            })?;
            pos += space + 1;

            let nul = data[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Error::corrupt_object(id, "tree entry name without NUL"))?;
            let name = &data[pos..pos + nul];
            pos += nul + 1;

            if data.len() < pos + ID_SIZE {
                return Err(Error::corrupt_object(id, "truncated tree entry id"));
            }
            let entry_id = ObjectId::from_slice(&data[pos..pos + ID_SIZE])?;
            pos += ID_SIZE;

            let entry = TreeEntry::from_name_bytes(mode, name, entry_id)
                .map_err(|e| Error::corrupt_object(id, e.to_string()))?;

            if let Some(last) = entries.last()
                && last.cmp(&entry) != Ordering::Less
            {
                return Err(Error::corrupt_object(
                    id,
                    format!("tree entries out of order at {:?}", entry.name),
                ));
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }
}

impl FromIterator<TreeEntry> for Tree {
    fn from_iter<I: IntoIterator<Item = TreeEntry>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    fn blob_id(data: &[u8]) -> ObjectId {
        ObjectId::hash_object(ObjectKind::Blob, data)
    }

    fn file(name: &str) -> TreeEntry {
        TreeEntry::new(FileMode::Regular, name, blob_id(name.as_bytes())).unwrap()
    }

    fn dir(name: &str) -> TreeEntry {
        TreeEntry::new(
            FileMode::Directory,
            name,
            ObjectId::hash_object(ObjectKind::Tree, b""),
        )
        .unwrap()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(FileMode::parse("100644"), Some(FileMode::Regular));
        assert_eq!(FileMode::parse("100755"), Some(FileMode::Executable));
        assert_eq!(FileMode::parse("100664"), Some(FileMode::Regular));
        assert_eq!(FileMode::parse("120000"), Some(FileMode::Symlink));
        assert_eq!(FileMode::parse("40000"), Some(FileMode::Directory));
        assert_eq!(FileMode::parse("040000"), Some(FileMode::Directory));
        assert_eq!(FileMode::parse("160000"), Some(FileMode::Gitlink));
        assert_eq!(FileMode::parse("100999"), None);
        assert_eq!(FileMode::parse(""), None);
        assert_eq!(FileMode::parse("777"), None);
    }

    #[test]
    fn test_entry_name_validation() {
        let id = blob_id(b"x");
        assert!(TreeEntry::new(FileMode::Regular, "", id).is_err());
        assert!(TreeEntry::new(FileMode::Regular, "a/b", id).is_err());
        assert!(TreeEntry::new(FileMode::Regular, "a\0b", id).is_err());
        assert!(TreeEntry::new(FileMode::Regular, "..", id).is_err());
        assert!(TreeEntry::new(FileMode::Regular, "ok.txt", id).is_ok());
    }

    #[test]
    fn test_git_ordering_of_subtrees() {
        // "foo.c" < "foo/" < "foo0": '.' (0x2e) < '/' (0x2f) < '0' (0x30)
        let tree = Tree::from_entries(vec![file("foo0"), dir("foo"), file("foo.c")]);
        let names: Vec<_> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["foo.c", "foo", "foo0"]);
    }

    #[test]
    fn test_file_sorts_before_longer_name() {
        let tree = Tree::from_entries(vec![file("ab"), file("a")]);
        assert_eq!(tree.entries()[0].name, "a");
    }

    #[test]
    fn test_insert_replaces_same_name() {
        let mut tree = Tree::from_entries(vec![file("a"), file("b")]);
        tree.insert(dir("a"));
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.get("a").unwrap().mode, FileMode::Directory);
        assert!(tree.remove("b").is_some());
        assert!(tree.remove("b").is_none());
    }

    #[test]
    fn test_encode_decode_tree() {
        let tree = Tree::from_entries(vec![file("b.txt"), dir("src"), file("a.txt")]);
        let encoded = tree.encode();
        let decoded = Tree::decode(&"t", &encoded).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_known_tree_id() {
        // `printf hello > hello.txt && git add . && git write-tree`
        let tree = Tree::from_entries(vec![
            TreeEntry::new(FileMode::Regular, "hello.txt", blob_id(b"hello")).unwrap(),
        ]);
        let id = ObjectId::hash_object(ObjectKind::Tree, &tree.encode());
        assert_eq!(id.to_hex(), "04df07b08ca746b3167d0f1d1514e2f39a52c16c");
    }

    #[test]
    fn test_empty_tree() {
        let tree = Tree::new();
        assert!(tree.encode().is_empty());
        assert!(Tree::decode(&"t", b"").unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let good = Tree::from_entries(vec![file("a")]).encode();

        // Truncated id
        assert!(Tree::decode(&"t", &good[..good.len() - 1]).is_err());
        // Bad mode
        let mut bad_mode = good.clone();
        bad_mode[0] = b'9';
        assert!(Tree::decode(&"t", &bad_mode).is_err());
        // Missing NUL
        assert!(Tree::decode(&"t", b"100644 name-without-nul").is_err());
    }

    #[test]
    fn test_decode_rejects_unsorted() {
        let mut buf = Vec::new();
        file("b").encode_into(&mut buf);
        file("a").encode_into(&mut buf);
        assert!(Tree::decode(&"t", &buf).is_err());
    }

    #[test]
    fn test_non_utf8_names_keep_their_bytes() {
        let id = blob_id(b"x");
        let mut payload = Vec::new();
        for name in [&b"caf\xe8.txt"[..], &b"caf\xe9.txt"[..], &b"plain"[..]] {
            payload.extend_from_slice(b"100644 ");
            payload.extend_from_slice(name);
            payload.push(0);
            payload.extend_from_slice(id.as_bytes());
        }

        let mut tree = Tree::decode(&"t", &payload).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.entries()[1].name, "caf\u{fffd}.txt");
        assert_eq!(tree.entries()[1].name_bytes(), b"caf\xe9.txt");
        assert_eq!(tree.encode(), payload);

        // Lookups by text never match a name that is not UTF-8.
        assert!(tree.get("caf\u{fffd}.txt").is_none());
        assert!(tree.get_bytes(b"caf\xe8.txt").is_some());

        tree.insert(file("new"));
        tree.remove("plain");
        let names: Vec<&[u8]> = tree.entries().iter().map(|e| e.name_bytes()).collect();
        assert_eq!(names, vec![&b"caf\xe8.txt"[..], &b"caf\xe9.txt"[..], &b"new"[..]]);
    }

    use proptest::prelude::*;

    fn arb_entry_name() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9._-]{1,40}".prop_filter("not . or ..", |s| s != "." && s != "..")
    }

    fn arb_tree_entry() -> impl Strategy<Value = TreeEntry> {
        (
            prop::sample::select(vec![
                FileMode::Regular,
                FileMode::Executable,
                FileMode::Symlink,
                FileMode::Directory,
                FileMode::Gitlink,
            ]),
            prop::array::uniform20(any::<u8>()),
            arb_entry_name(),
        )
            .prop_map(|(mode, bytes, name)| {
                TreeEntry::new(mode, name, ObjectId::from_bytes(bytes)).unwrap()
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Insertion order never changes the tree id.
        #[test]
        fn prop_tree_canonicalization_order_independent(
            entries in prop::collection::btree_map(arb_entry_name(), arb_tree_entry(), 1..20)
        ) {
            let entries: Vec<TreeEntry> = entries
                .into_iter()
                .map(|(name, e)| TreeEntry { name, ..e })
                .collect();

            let forward = Tree::from_entries(entries.clone());
            let mut reversed_input = entries;
            reversed_input.reverse();
            let reversed = Tree::from_entries(reversed_input);

            prop_assert_eq!(
                ObjectId::hash_object(ObjectKind::Tree, &forward.encode()),
                ObjectId::hash_object(ObjectKind::Tree, &reversed.encode())
            );
        }

        /// Encoded trees decode to themselves.
        #[test]
        fn prop_tree_roundtrip(entries in prop::collection::vec(arb_tree_entry(), 0..20)) {
            let tree = Tree::from_entries(entries);
            let decoded = Tree::decode(&"t", &tree.encode())?;
            prop_assert_eq!(decoded, tree);
        }
    }
}
