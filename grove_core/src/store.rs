//! Loose object storage.
//!
//! Objects live at `objects/<2 hex>/<38 hex>` as zlib-compressed framed
//! bytes, the layout Git uses for loose objects. Files are written once and
//! never modified.

use crate::config::DEFAULT_COMPRESSION;
use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::{Commit, Object, ObjectKind, Tag, parse_frame};
use crate::tree::Tree;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A content-addressed object directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    objects_dir: PathBuf,
    compression: u32,
}

impl ObjectStore {
    /// Open the object directory at `objects_dir` with the given zlib level.
    pub fn new(objects_dir: impl Into<PathBuf>, compression: u32) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            compression: compression.min(9),
        }
    }

    /// Open with Git's default compression level.
    pub fn with_default_compression(objects_dir: impl Into<PathBuf>) -> Self {
        Self::new(objects_dir, DEFAULT_COMPRESSION)
    }

    /// Root of the object directory.
    pub fn dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Get the path to an object file given its id.
    ///
    /// Returns: `objects/{prefix}/{suffix}`
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.objects_dir.join(id.prefix()).join(id.suffix())
    }

    /// Whether an object with this id is stored.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    /// Compute the id an object would get, without writing it.
    pub fn hash_only(&self, object: &Object) -> ObjectId {
        object.id()
    }

    /// Store an object, returning its id. Storing an existing object is a no-op.
    pub fn put(&self, object: &Object) -> Result<ObjectId> {
        let (framed, id) = object.encode();
        self.write_framed(&id, object.kind(), &framed)?;
        Ok(id)
    }

    /// Store raw blob content.
    pub fn put_blob(&self, content: &[u8]) -> Result<ObjectId> {
        let mut framed = ObjectKind::Blob.header(content.len()).into_bytes();
        framed.extend_from_slice(content);
        let id = ObjectId::hash_framed(&framed);
        self.write_framed(&id, ObjectKind::Blob, &framed)?;
        Ok(id)
    }

    /// Store a tree.
    pub fn put_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.put_payload(ObjectKind::Tree, &tree.encode())
    }

    /// Store a commit.
    pub fn put_commit(&self, commit: &Commit) -> Result<ObjectId> {
        self.put_payload(ObjectKind::Commit, &commit.encode())
    }

    fn put_payload(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        let mut framed = kind.header(payload.len()).into_bytes();
        framed.extend_from_slice(payload);
        let id = ObjectId::hash_framed(&framed);
        self.write_framed(&id, kind, &framed)?;
        Ok(id)
    }

    /// Compress framed bytes into place unless the object already exists.
    fn write_framed(&self, id: &ObjectId, kind: ObjectKind, framed: &[u8]) -> Result<()> {
        if self.contains(id) {
            return Ok(());
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.compression));
        encoder.write_all(framed)?;
        let compressed = encoder.finish()?;

        self.write_compressed_atomic(id, &compressed)?;
        debug!(id = %id, kind = %kind, size = framed.len(), "wrote object");
        Ok(())
    }

    /// Write compressed bytes atomically using tempfile.
    ///
    /// Losing a race against a writer of the same id is success: both wrote
    /// identical content.
    fn write_compressed_atomic(&self, id: &ObjectId, compressed: &[u8]) -> Result<()> {
        let obj_path = self.object_path(id);
        let shard = self.objects_dir.join(id.prefix());
        fs::create_dir_all(&shard)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(&shard)?;
        temp_file.write_all(compressed)?;
        temp_file.as_file().sync_all()?;

        match temp_file.persist_noclobber(&obj_path) {
            Ok(_) => Ok(()),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Read, inflate and verify an object's framed bytes.
    fn read_framed(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let path = self.object_path(id);
        let compressed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::object_not_found(*id));
            }
            Err(err) => return Err(err.into()),
        };
        inflate_verified(id, &compressed)
    }

    /// Read an object's kind and payload without decoding the payload.
    pub fn get_raw(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>)> {
        let framed = self.read_framed(id)?;
        let (kind, payload) = parse_frame(id, &framed)?;
        Ok((kind, payload.to_vec()))
    }

    /// Read and decode an object.
    pub fn get(&self, id: &ObjectId) -> Result<Object> {
        let framed = self.read_framed(id)?;
        Object::decode(id, &framed)
    }

    /// Read a blob's content.
    pub fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>> {
        let (kind, payload) = self.get_raw(id)?;
        if kind != ObjectKind::Blob {
            return Err(Error::unexpected_kind(*id, "blob", kind.as_str()));
        }
        Ok(payload)
    }

    /// Read a tree.
    pub fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        let (kind, payload) = self.get_raw(id)?;
        if kind != ObjectKind::Tree {
            return Err(Error::unexpected_kind(*id, "tree", kind.as_str()));
        }
        Tree::decode(id, &payload)
    }

    /// Read a commit.
    pub fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        let (kind, payload) = self.get_raw(id)?;
        if kind != ObjectKind::Commit {
            return Err(Error::unexpected_kind(*id, "commit", kind.as_str()));
        }
        Commit::decode(id, &payload)
    }

    /// Read an annotated tag.
    pub fn read_tag(&self, id: &ObjectId) -> Result<Tag> {
        let (kind, payload) = self.get_raw(id)?;
        if kind != ObjectKind::Tag {
            return Err(Error::unexpected_kind(*id, "tag", kind.as_str()));
        }
        Tag::decode(id, &payload)
    }

    /// Copy an object's compressed file into another store after verifying it.
    ///
    /// Returns `false` if the destination already had the object.
    pub fn copy_raw_to(&self, id: &ObjectId, dest: &ObjectStore) -> Result<bool> {
        if dest.contains(id) {
            return Ok(false);
        }
        let compressed = match fs::read(self.object_path(id)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::object_not_found(*id));
            }
            Err(err) => return Err(err.into()),
        };
        inflate_verified(id, &compressed)?;
        dest.write_compressed_atomic(id, &compressed)?;
        Ok(true)
    }
}

/// Inflate a loose object file and check that it hashes to `id`.
fn inflate_verified(id: &ObjectId, compressed: &[u8]) -> Result<Vec<u8>> {
    let mut framed = Vec::new();
    if let Err(err) = ZlibDecoder::new(compressed).read_to_end(&mut framed) {
        warn!(id = %id, error = %err, "object failed to inflate");
        return Err(Error::corrupt_object(id, format!("zlib: {}", err)));
    }

    let actual = ObjectId::hash_framed(&framed);
    if actual != *id {
        warn!(id = %id, actual = %actual, "object hash mismatch");
        return Err(Error::corrupt_object(
            id,
            format!("content hashes to {}", actual),
        ));
    }
    Ok(framed)
}
