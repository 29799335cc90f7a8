//! Object ids: SHA-1 digests of Git object encodings.

use crate::error::{Error, Result};
use crate::object::ObjectKind;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Digest size in bytes (SHA-1 produces 160-bit hashes).
pub const ID_SIZE: usize = 20;

/// Length of an id in hex characters.
pub const HEX_LEN: usize = ID_SIZE * 2;

/// A 20-byte SHA-1 object id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; ID_SIZE]);

impl ObjectId {
    /// The all-zero id Git uses for "no object" in reflogs.
    pub const ZERO: ObjectId = ObjectId([0u8; ID_SIZE]);

    /// Create an id from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        ObjectId(bytes)
    }

    /// Create an id from a slice, which must be exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; ID_SIZE] = bytes.try_into().map_err(|_| {
            Error::invalid_object_id(format!(
                "Expected {} bytes, got {}",
                ID_SIZE,
                bytes.len()
            ))
        })?;
        Ok(ObjectId(raw))
    }

    /// Create an id from a hex string (40 hex characters).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != HEX_LEN {
            return Err(Error::invalid_object_id(format!(
                "Expected {} hex characters, got {}",
                HEX_LEN,
                hex_str.len()
            )));
        }

        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid_object_id(format!("Invalid hex: {}", e)))?;

        Self::from_slice(&bytes)
    }

    /// Convert to hex string (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated hex for log lines and messages.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Get the first 2 hex characters (object directory shard).
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Get the remaining 38 hex characters (object file name).
    pub fn suffix(&self) -> String {
        hex::encode(&self.0[1..])
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Whether this is the all-zero id.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_SIZE]
    }

    /// Hash a payload the way Git does: `"<kind> <size>\0"` followed by the payload.
    pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(kind.header(payload.len()));
        hasher.update(payload);
        ObjectId(hasher.finalize().into())
    }

    /// Hash an already-framed object (header included).
    pub fn hash_framed(framed: &[u8]) -> Self {
        ObjectId(Sha1::digest(framed).into())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ObjectId::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_blob_id() {
        let id = ObjectId::hash_object(ObjectKind::Blob, b"");
        assert_eq!(id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_hello_blob_id() {
        // git hash-object on "hello\n"
        let id = ObjectId::hash_object(ObjectKind::Blob, b"hello\n");
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_empty_tree_id() {
        let id = ObjectId::hash_object(ObjectKind::Tree, b"");
        assert_eq!(id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn test_hash_framed_matches_hash_object() {
        let framed = b"blob 6\0hello\n";
        assert_eq!(
            ObjectId::hash_framed(framed),
            ObjectId::hash_object(ObjectKind::Blob, b"hello\n")
        );
    }

    #[test]
    fn test_from_hex_invalid_length() {
        assert!(ObjectId::from_hex("abcd").is_err());
        assert!(ObjectId::from_hex("").is_err());
    }

    #[test]
    fn test_from_hex_invalid_chars() {
        let invalid = "z".repeat(HEX_LEN);
        assert!(ObjectId::from_hex(&invalid).is_err());
    }

    #[test]
    fn test_prefix_suffix() {
        let id = ObjectId::hash_object(ObjectKind::Blob, b"test");
        assert_eq!(id.prefix().len(), 2);
        assert_eq!(id.suffix().len(), 38);
        assert_eq!(format!("{}{}", id.prefix(), id.suffix()), id.to_hex());
    }

    #[test]
    fn test_zero() {
        assert!(ObjectId::ZERO.is_zero());
        assert_eq!(ObjectId::ZERO.to_hex(), "0".repeat(HEX_LEN));
        assert!(!ObjectId::hash_object(ObjectKind::Blob, b"").is_zero());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = ObjectId::hash_object(ObjectKind::Blob, b"");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\"");
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Hashing the same payload always produces the same id.
        #[test]
        fn prop_hash_deterministic(data: Vec<u8>) {
            let a = ObjectId::hash_object(ObjectKind::Blob, &data);
            let b = ObjectId::hash_object(ObjectKind::Blob, &data);
            prop_assert_eq!(a, b);
        }

        /// The kind is part of the hashed bytes.
        #[test]
        fn prop_kind_separates_ids(data: Vec<u8>) {
            let blob = ObjectId::hash_object(ObjectKind::Blob, &data);
            let tree = ObjectId::hash_object(ObjectKind::Tree, &data);
            prop_assert_ne!(blob, tree);
        }

        /// Hex text parses back to the same id.
        #[test]
        fn prop_hex_roundtrip(bytes in prop::array::uniform20(any::<u8>())) {
            let id = ObjectId::from_bytes(bytes);
            prop_assert_eq!(ObjectId::from_hex(&id.to_hex())?, id);
        }

        /// Wrong-length hex always fails.
        #[test]
        fn prop_invalid_hex_length_fails(s in "[0-9a-f]{0,39}|[0-9a-f]{41,80}") {
            prop_assert!(ObjectId::from_hex(&s).is_err());
        }
    }
}
