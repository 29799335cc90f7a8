//! Object encoding and framing.
//!
//! Every object is framed exactly as Git frames loose objects, before
//! compression:
//!
//! ```text
//! <kind> SP <payload length in decimal> NUL <payload>
//! ```
//!
//! The object id is the SHA-1 of the framed bytes, so compression never
//! affects ids. Payload formats:
//!
//! - blob: raw bytes
//! - tree: see [`crate::tree`]
//! - commit: `tree`, `parent`*, `author`, `committer`, extra headers, blank
//!   line, message
//! - tag: `object`, `type`, `tag`, `tagger`?, blank line, message
//!
//! Commit and tag messages are kept as the exact bytes stored. Identity
//! lines and other header values are text in the object's declared
//! `encoding` (UTF-8 when absent); Latin-1 objects decode and re-encode
//! byte for byte.

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::tree::Tree;
use chrono::{FixedOffset, Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Longest header we accept (`commit 18446744073709551615\0`).
const MAX_HEADER_LEN: usize = 32;

/// Object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Snapshot plus history links.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectKind {
    /// Get the string name of this kind, as written in the header.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
            ObjectKind::Tag => "tag",
        }
    }

    /// Parse from the header name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "blob" => Some(ObjectKind::Blob),
            "tree" => Some(ObjectKind::Tree),
            "commit" => Some(ObjectKind::Commit),
            "tag" => Some(ObjectKind::Tag),
            _ => None,
        }
    }

    /// Header bytes for a payload of `len` bytes.
    pub fn header(&self, len: usize) -> String {
        format!("{} {}\0", self.as_str(), len)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split framed bytes into kind and payload.
///
/// `id` is only used to label errors.
pub fn parse_frame<'a>(id: &dyn fmt::Display, framed: &'a [u8]) -> Result<(ObjectKind, &'a [u8])> {
    let window = &framed[..framed.len().min(MAX_HEADER_LEN)];
    let nul = window
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::corrupt_object(id, "missing NUL in object header"))?;

    let header = std::str::from_utf8(&framed[..nul])
        .map_err(|_| Error::corrupt_object(id, "object header is not UTF-8"))?;
    let (kind_name, size_text) = header
        .split_once(' ')
        .ok_or_else(|| Error::corrupt_object(id, "missing space in object header"))?;

    let kind = ObjectKind::parse(kind_name)
        .ok_or_else(|| Error::corrupt_object(id, format!("unknown object kind {:?}", kind_name)))?;

    if size_text.is_empty() || !size_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::corrupt_object(
            id,
            format!("invalid object size {:?}", size_text),
        ));
    }
    let declared: usize = size_text
        .parse()
        .map_err(|_| Error::corrupt_object(id, format!("invalid object size {:?}", size_text)))?;

    let payload = &framed[nul + 1..];
    if payload.len() != declared {
        return Err(Error::corrupt_object(
            id,
            format!(
                "Payload length mismatch: header says {}, got {}",
                declared,
                payload.len()
            ),
        ));
    }

    Ok((kind, payload))
}

/// A person and moment, as written in `author`/`committer`/`tagger` lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// Offset from UTC in minutes.
    pub offset_minutes: i32,
}

impl Signature {
    /// Create a signature at an explicit time.
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        time: i64,
        offset_minutes: i32,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            time,
            offset_minutes,
        }
    }

    /// Create a signature stamped with the current local time.
    pub fn now(name: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Local::now();
        Self::new(
            name,
            email,
            now.timestamp(),
            now.offset().local_minus_utc() / 60,
        )
    }

    /// Render the UTC offset as `+HHMM` / `-HHMM`.
    pub fn offset_string(&self) -> String {
        let sign = if self.offset_minutes < 0 { '-' } else { '+' };
        let abs = self.offset_minutes.unsigned_abs();
        format!("{}{:02}{:02}", sign, abs / 60, abs % 60)
    }

    /// Render as a local date-time, falling back to UTC for odd offsets.
    pub fn datetime(&self) -> Option<chrono::DateTime<FixedOffset>> {
        let offset = FixedOffset::east_opt(self.offset_minutes * 60)
            .or_else(|| FixedOffset::east_opt(0))?;
        offset.timestamp_opt(self.time, 0).single()
    }

    /// Encode as `Name <email> 1700000000 +0100`.
    pub fn encode(&self) -> String {
        format!(
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.time,
            self.offset_string()
        )
    }

    /// Parse the `Name <email> time offset` form.
    pub fn parse(text: &str) -> Option<Self> {
        let open = text.find('<')?;
        let close = open + text[open..].find('>')?;
        let name = text[..open].trim_end().to_string();
        let email = text[open + 1..close].to_string();

        let mut rest = text[close + 1..].split_whitespace();
        let time: i64 = rest.next()?.parse().ok()?;
        let offset_minutes = match rest.next() {
            Some(tz) => parse_offset(tz)?,
            None => 0,
        };

        Some(Self {
            name,
            email,
            time,
            offset_minutes,
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Parse `+HHMM` / `-HHMM` into minutes.
fn parse_offset(tz: &str) -> Option<i32> {
    let (sign, digits) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    Some(sign * (hours * 60 + minutes))
}

/// A commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    /// Headers after `committer` (e.g. `encoding`, `gpgsig`), value lines
    /// joined by `\n`.
    pub extra_headers: Vec<(String, String)>,
    /// Message bytes as stored.
    pub message: Vec<u8>,
}

impl Commit {
    /// Create a commit with no extra headers.
    pub fn new(
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: Signature,
        committer: Signature,
        message: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            tree,
            parents,
            author,
            committer,
            extra_headers: Vec::new(),
            message: message.into(),
        }
    }

    /// Value of the `encoding` header, if any.
    pub fn encoding(&self) -> Option<&str> {
        header_value(&self.extra_headers, "encoding")
    }

    /// Message as text, decoded per the `encoding` header.
    pub fn message_text(&self) -> Cow<'_, str> {
        TextEncoding::from_headers(&self.extra_headers).decode(&self.message)
    }

    /// First line of the message.
    pub fn summary(&self) -> String {
        self.message_text().lines().next().unwrap_or("").to_string()
    }

    /// Whether this commit has more than one parent.
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// Encode the commit payload.
    pub fn encode(&self) -> Vec<u8> {
        let encoding = TextEncoding::from_headers(&self.extra_headers);
        let mut out = Vec::new();
        out.extend_from_slice(format!("tree {}\n", self.tree).as_bytes());
        for parent in &self.parents {
            out.extend_from_slice(format!("parent {}\n", parent).as_bytes());
        }
        push_header(&mut out, encoding, "author", &self.author.encode());
        push_header(&mut out, encoding, "committer", &self.committer.encode());
        for (key, value) in &self.extra_headers {
            push_header(&mut out, encoding, key, value);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    /// Decode a commit payload.
    pub fn decode(id: &dyn fmt::Display, payload: &[u8]) -> Result<Self> {
        let (headers, message) = split_headers(id, payload)?;
        let encoding = TextEncoding::from_raw_headers(&headers);

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key {
                b"tree" if tree.is_none() => tree = Some(parse_id(id, "tree", &value)?),
                b"parent" => parents.push(parse_id(id, "parent", &value)?),
                b"author" if author.is_none() => {
                    author = Some(parse_signature(id, "author", &encoding.decode(&value))?)
                }
                b"committer" if committer.is_none() => {
                    committer = Some(parse_signature(id, "committer", &encoding.decode(&value))?)
                }
                _ => extra_headers.push(decode_header(id, encoding, key, &value)?),
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| Error::corrupt_object(id, "commit has no tree"))?,
            parents,
            author: author.ok_or_else(|| Error::corrupt_object(id, "commit has no author"))?,
            committer: committer
                .ok_or_else(|| Error::corrupt_object(id, "commit has no committer"))?,
            extra_headers,
            message: message.to_vec(),
        })
    }
}

/// An annotated tag object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub object: ObjectId,
    pub target_kind: ObjectKind,
    pub name: String,
    pub tagger: Option<Signature>,
    pub extra_headers: Vec<(String, String)>,
    /// Message bytes as stored.
    pub message: Vec<u8>,
}

impl Tag {
    /// Message as text, decoded per the `encoding` header.
    pub fn message_text(&self) -> Cow<'_, str> {
        TextEncoding::from_headers(&self.extra_headers).decode(&self.message)
    }

    /// Encode the tag payload.
    pub fn encode(&self) -> Vec<u8> {
        let encoding = TextEncoding::from_headers(&self.extra_headers);
        let mut out = Vec::new();
        out.extend_from_slice(format!("object {}\n", self.object).as_bytes());
        out.extend_from_slice(format!("type {}\n", self.target_kind).as_bytes());
        push_header(&mut out, encoding, "tag", &self.name);
        if let Some(tagger) = &self.tagger {
            push_header(&mut out, encoding, "tagger", &tagger.encode());
        }
        for (key, value) in &self.extra_headers {
            push_header(&mut out, encoding, key, value);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }

    /// Decode a tag payload.
    pub fn decode(id: &dyn fmt::Display, payload: &[u8]) -> Result<Self> {
        let (headers, message) = split_headers(id, payload)?;
        let encoding = TextEncoding::from_raw_headers(&headers);

        let mut object = None;
        let mut target_kind = None;
        let mut name = None;
        let mut tagger = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key {
                b"object" if object.is_none() => object = Some(parse_id(id, "object", &value)?),
                b"type" if target_kind.is_none() => {
                    let text = String::from_utf8_lossy(&value);
                    target_kind = Some(ObjectKind::parse(&text).ok_or_else(|| {
                        Error::corrupt_object(id, format!("tag points at unknown kind {:?}", text))
                    })?)
                }
                b"tag" if name.is_none() => name = Some(encoding.decode(&value).into_owned()),
                b"tagger" if tagger.is_none() => {
                    tagger = Some(parse_signature(id, "tagger", &encoding.decode(&value))?)
                }
                _ => extra_headers.push(decode_header(id, encoding, key, &value)?),
            }
        }

        Ok(Self {
            object: object.ok_or_else(|| Error::corrupt_object(id, "tag has no object"))?,
            target_kind: target_kind.ok_or_else(|| Error::corrupt_object(id, "tag has no type"))?,
            name: name.ok_or_else(|| Error::corrupt_object(id, "tag has no name"))?,
            tagger,
            extra_headers,
            message: message.to_vec(),
        })
    }
}

/// Character encoding of a commit's or tag's header text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextEncoding {
    /// UTF-8; invalid sequences decode to U+FFFD.
    Utf8,
    /// ISO-8859-1: one byte per char, lossless both ways.
    Latin1,
}

impl TextEncoding {
    fn from_label(label: Option<&str>) -> Self {
        const LATIN1: [&str; 5] = ["iso-8859-1", "iso8859-1", "latin1", "latin-1", "l1"];
        match label {
            Some(label) if LATIN1.iter().any(|l| l.eq_ignore_ascii_case(label.trim())) => {
                TextEncoding::Latin1
            }
            _ => TextEncoding::Utf8,
        }
    }

    fn from_headers(headers: &[(String, String)]) -> Self {
        Self::from_label(header_value(headers, "encoding"))
    }

    fn from_raw_headers(headers: &[(&[u8], Vec<u8>)]) -> Self {
        let label = headers
            .iter()
            .find(|(key, _)| *key == b"encoding")
            .and_then(|(_, value)| std::str::from_utf8(value).ok());
        Self::from_label(label)
    }

    fn decode(self, bytes: &[u8]) -> Cow<'_, str> {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes),
            TextEncoding::Latin1 => Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }

    fn encode_into(self, text: &str, out: &mut Vec<u8>) {
        match self {
            TextEncoding::Utf8 => out.extend_from_slice(text.as_bytes()),
            TextEncoding::Latin1 => {
                for c in text.chars() {
                    match u8::try_from(c) {
                        Ok(byte) => out.push(byte),
                        // Not representable; written as UTF-8 like Git does.
                        Err(_) => out.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
                    }
                }
            }
        }
    }
}

fn header_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.as_str())
}

/// A decoded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Vec<u8>),
    Tree(Tree),
    Commit(Commit),
    Tag(Tag),
}

impl Object {
    /// Kind of this object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Commit(_) => ObjectKind::Commit,
            Object::Tag(_) => ObjectKind::Tag,
        }
    }

    /// Canonical payload bytes (no header).
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Object::Blob(data) => data.clone(),
            Object::Tree(tree) => tree.encode(),
            Object::Commit(commit) => commit.encode(),
            Object::Tag(tag) => tag.encode(),
        }
    }

    /// Encode to framed bytes and compute the id.
    pub fn encode(&self) -> (Vec<u8>, ObjectId) {
        let payload = self.payload();
        let mut framed = self.kind().header(payload.len()).into_bytes();
        framed.extend_from_slice(&payload);
        let id = ObjectId::hash_framed(&framed);
        (framed, id)
    }

    /// Id of this object without keeping the encoding.
    pub fn id(&self) -> ObjectId {
        ObjectId::hash_object(self.kind(), &self.payload())
    }

    /// Decode framed bytes. `id` labels errors only; verification is the store's job.
    pub fn decode(id: &dyn fmt::Display, framed: &[u8]) -> Result<Self> {
        let (kind, payload) = parse_frame(id, framed)?;
        Self::decode_payload(id, kind, payload)
    }

    /// Decode a payload of a known kind.
    pub fn decode_payload(id: &dyn fmt::Display, kind: ObjectKind, payload: &[u8]) -> Result<Self> {
        Ok(match kind {
            ObjectKind::Blob => Object::Blob(payload.to_vec()),
            ObjectKind::Tree => Object::Tree(Tree::decode(id, payload)?),
            ObjectKind::Commit => Object::Commit(Commit::decode(id, payload)?),
            ObjectKind::Tag => Object::Tag(Tag::decode(id, payload)?),
        })
    }
}

fn push_header(out: &mut Vec<u8>, encoding: TextEncoding, key: &str, value: &str) {
    out.extend_from_slice(key.as_bytes());
    out.push(b' ');
    // Continuation lines are prefixed with a single space.
    encoding.encode_into(&value.replace('\n', "\n "), out);
    out.push(b'\n');
}

fn decode_header(
    id: &dyn fmt::Display,
    encoding: TextEncoding,
    key: &[u8],
    value: &[u8],
) -> Result<(String, String)> {
    let key = std::str::from_utf8(key)
        .map_err(|_| Error::corrupt_object(id, "header name is not UTF-8"))?;
    Ok((key.to_string(), encoding.decode(value).into_owned()))
}

/// Split `key value` header lines (with space-continued values) from the message.
fn split_headers<'a>(
    id: &dyn fmt::Display,
    payload: &'a [u8],
) -> Result<(Vec<(&'a [u8], Vec<u8>)>, &'a [u8])> {
    let mut headers: Vec<(&[u8], Vec<u8>)> = Vec::new();
    let mut rest = payload;

    loop {
        let (line, after) = match rest.iter().position(|&b| b == b'\n') {
            Some(end) => (&rest[..end], &rest[end + 1..]),
            None if rest.is_empty() => return Ok((headers, rest)),
            None => return Err(Error::corrupt_object(id, "header line without newline")),
        };

        if line.is_empty() {
            return Ok((headers, after));
        }

        if let Some(continuation) = line.strip_prefix(b" ") {
            let (_, value) = headers
                .last_mut()
                .ok_or_else(|| Error::corrupt_object(id, "continuation line before any header"))?;
            value.push(b'\n');
            value.extend_from_slice(continuation);
        } else {
            let (key, value) = match line.iter().position(|&b| b == b' ') {
                Some(space) => (&line[..space], &line[space + 1..]),
                None => (line, &line[line.len()..]),
            };
            headers.push((key, value.to_vec()));
        }

        rest = after;
    }
}

fn parse_id(id: &dyn fmt::Display, field: &str, value: &[u8]) -> Result<ObjectId> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|hex| ObjectId::from_hex(hex).ok())
        .ok_or_else(|| {
            Error::corrupt_object(
                id,
                format!("invalid {} id {:?}", field, String::from_utf8_lossy(value)),
            )
        })
}

fn parse_signature(id: &dyn fmt::Display, field: &str, value: &str) -> Result<Signature> {
    Signature::parse(value)
        .ok_or_else(|| Error::corrupt_object(id, format!("malformed {} line {:?}", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> Signature {
        Signature::new("A U Thor", "author@example.com", 1_112_911_993, 120)
    }

    fn sample_commit() -> Commit {
        Commit::new(
            ObjectId::hash_object(ObjectKind::Tree, b""),
            vec![ObjectId::hash_object(ObjectKind::Blob, b"p")],
            sig(),
            sig(),
            "Initial import\n\nWith a body.\n",
        )
    }

    #[test]
    fn test_kind_names() {
        for kind in [
            ObjectKind::Blob,
            ObjectKind::Tree,
            ObjectKind::Commit,
            ObjectKind::Tag,
        ] {
            assert_eq!(ObjectKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ObjectKind::parse("chunk"), None);
    }

    #[test]
    fn test_parse_frame_ok() {
        let (kind, payload) = parse_frame(&"x", b"blob 5\0hello").unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_parse_frame_size_mismatch() {
        let err = parse_frame(&"x", b"blob 6\0hello").unwrap_err();
        assert!(matches!(err, Error::CorruptObject { .. }));
    }

    #[test]
    fn test_parse_frame_unknown_kind() {
        let err = parse_frame(&"x", b"chunk 5\0hello").unwrap_err();
        assert!(matches!(err, Error::CorruptObject { .. }));
    }

    #[test]
    fn test_parse_frame_malformed_headers() {
        assert!(parse_frame(&"x", b"blob5\0hello").is_err());
        assert!(parse_frame(&"x", b"blob 5hello").is_err());
        assert!(parse_frame(&"x", b"blob -5\0hello").is_err());
        assert!(parse_frame(&"x", b"blob \0").is_err());
        assert!(parse_frame(&"x", b"").is_err());
    }

    #[test]
    fn test_signature_roundtrip() {
        let s = Signature::new("Jane Doe", "jane@example.com", 1_700_000_000, -330);
        assert_eq!(s.encode(), "Jane Doe <jane@example.com> 1700000000 -0530");
        assert_eq!(Signature::parse(&s.encode()), Some(s));
    }

    #[test]
    fn test_signature_parse_rejects_garbage() {
        assert!(Signature::parse("no email here 123 +0000").is_none());
        assert!(Signature::parse("Name <e@x> notanumber +0000").is_none());
        assert!(Signature::parse("Name <e@x> 12 0100").is_none());
    }

    #[test]
    fn test_signature_datetime() {
        let s = Signature::new("a", "b", 0, 60);
        let dt = s.datetime().unwrap();
        assert_eq!(dt.to_rfc3339(), "1970-01-01T01:00:00+01:00");
    }

    #[test]
    fn test_commit_encoding_layout() {
        let commit = sample_commit();
        let text = String::from_utf8(commit.encode()).unwrap();
        let expected = format!(
            "tree {}\nparent {}\nauthor {}\ncommitter {}\n\nInitial import\n\nWith a body.\n",
            commit.tree,
            commit.parents[0],
            sig().encode(),
            sig().encode()
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_commit_decode_roundtrip_with_gpgsig() {
        let mut commit = sample_commit();
        commit.extra_headers.push((
            "gpgsig".to_string(),
            "-----BEGIN PGP SIGNATURE-----\n\nabc\n-----END PGP SIGNATURE-----".to_string(),
        ));
        let bytes = commit.encode();
        let decoded = Commit::decode(&"c", &bytes).unwrap();
        assert_eq!(decoded, commit);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_commit_missing_fields() {
        let no_tree = format!("author {}\ncommitter {}\n\nmsg", sig().encode(), sig().encode());
        assert!(Commit::decode(&"c", no_tree.as_bytes()).is_err());

        let bad_parent = format!(
            "tree {}\nparent nothex\nauthor {}\ncommitter {}\n\nmsg",
            ObjectId::ZERO,
            sig().encode(),
            sig().encode()
        );
        assert!(Commit::decode(&"c", bad_parent.as_bytes()).is_err());
    }

    #[test]
    fn test_known_commit_id() {
        // Layout `git commit-tree` writes for an empty tree with pinned dates.
        let payload = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                       author A <a@b.c> 0 +0000\n\
                       committer A <a@b.c> 0 +0000\n\
                       \n\
                       x\n";
        let commit = Commit::decode(&"c", payload.as_bytes()).unwrap();
        assert_eq!(commit.encode(), payload.as_bytes());
        assert_eq!(commit.summary(), "x");
        assert!(!commit.is_merge());
    }

    /// `encoding ISO-8859-1` commit as `git hash-object -t commit` sees it.
    const LATIN1_COMMIT: &[u8] = b"tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
        author Jos\xe9 <jose@example.com> 1700000000 +0100\n\
        committer Jos\xe9 <jose@example.com> 1700000000 +0100\n\
        encoding ISO-8859-1\n\
        \n\
        caf\xe9\n";

    #[test]
    fn test_latin1_commit_known_id() {
        let commit = Commit::decode(&"c", LATIN1_COMMIT).unwrap();
        assert_eq!(commit.author.name, "Jos\u{e9}");
        assert_eq!(commit.encoding(), Some("ISO-8859-1"));
        assert_eq!(commit.message, b"caf\xe9\n");
        assert_eq!(commit.message_text(), "caf\u{e9}\n");
        assert_eq!(commit.summary(), "caf\u{e9}");

        assert_eq!(commit.encode(), LATIN1_COMMIT);
        assert_eq!(
            Object::Commit(commit).id().to_hex(),
            "07cbc071c65a46c37276a6b092ce8bc6aa6cb40e"
        );
    }

    #[test]
    fn test_undeclared_non_utf8_message_is_kept() {
        let mut payload = format!(
            "tree {}\nauthor {}\ncommitter {}\n\n",
            ObjectId::ZERO,
            sig().encode(),
            sig().encode()
        )
        .into_bytes();
        payload.extend_from_slice(b"r\xe9sum\xe9 \xff\n");

        let commit = Commit::decode(&"c", &payload).unwrap();
        assert_eq!(commit.summary(), "r\u{fffd}sum\u{fffd} \u{fffd}");
        assert_eq!(commit.encode(), payload);
    }

    #[test]
    fn test_latin1_tag_roundtrip() {
        let payload = format!(
            "object {}\ntype commit\ntag v1\ntagger Jos\u{e9} <j@x> 5 +0000\nencoding latin1\n\n",
            ObjectId::ZERO
        );
        // Latin-1 bytes for the text above, then a Latin-1 message.
        let mut bytes: Vec<u8> = payload.chars().map(|c| c as u32 as u8).collect();
        bytes.extend_from_slice(b"fin\xe9\n");

        let tag = Tag::decode(&"t", &bytes).unwrap();
        assert_eq!(tag.tagger.as_ref().unwrap().name, "Jos\u{e9}");
        assert_eq!(tag.message_text(), "fin\u{e9}\n");
        assert_eq!(tag.encode(), bytes);
    }

    #[test]
    fn test_tag_roundtrip() {
        let tag = Tag {
            object: ObjectId::hash_object(ObjectKind::Commit, b"c"),
            target_kind: ObjectKind::Commit,
            name: "v1.0".to_string(),
            tagger: Some(sig()),
            extra_headers: Vec::new(),
            message: b"Release 1.0\n".to_vec(),
        };
        let bytes = tag.encode();
        assert_eq!(Tag::decode(&"t", &bytes).unwrap(), tag);
    }

    #[test]
    fn test_object_encode_decode() {
        let object = Object::Commit(sample_commit());
        let (framed, id) = object.encode();
        assert_eq!(id, object.id());
        assert!(framed.starts_with(b"commit "));
        assert_eq!(Object::decode(&id, &framed).unwrap(), object);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 10000,
            ..ProptestConfig::default()
        })]

        /// Blob bytes survive framing untouched.
        #[test]
        fn prop_blob_frame_roundtrip(data: Vec<u8>) {
            let object = Object::Blob(data.clone());
            let (framed, id) = object.encode();
            prop_assert_eq!(id, ObjectId::hash_object(ObjectKind::Blob, &data));
            prop_assert_eq!(Object::decode(&id, &framed)?, Object::Blob(data));
        }

        /// Truncating a framed object is always detected.
        #[test]
        fn prop_truncation_detected(data in prop::collection::vec(any::<u8>(), 1..512), cut in 1usize..512) {
            let (framed, id) = Object::Blob(data).encode();
            let cut = cut.min(framed.len() - 1).max(1);
            let truncated = &framed[..framed.len() - cut];
            prop_assert!(Object::decode(&id, truncated).is_err());
        }

        /// Offsets survive signature encoding.
        #[test]
        fn prop_signature_offset_roundtrip(time in 0i64..4_000_000_000, offset in -720i32..=840) {
            let s = Signature::new("N", "e@x", time, offset);
            prop_assert_eq!(Signature::parse(&s.encode()), Some(s));
        }
    }
}
