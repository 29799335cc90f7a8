//! Per-ref transition logs under `logs/<refname>`.
//!
//! One line per transition, in the format Git writes:
//!
//! ```text
//! <old hex> SP <new hex> SP <name> <<email>> <time> <tz> TAB <message> LF
//! ```
//!
//! Creation logs the zero id as `old`; deletion logs it as `new`.

use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::object::Signature;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// Who moved a ref, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    pub who: Signature,
    pub message: String,
}

impl Reason {
    /// A reason attributed to `who`.
    pub fn new(who: &Signature, message: impl Into<String>) -> Self {
        Self {
            who: who.clone(),
            message: message.into(),
        }
    }

    /// A reason attributed to the engine itself, stamped now.
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            who: Signature::now("grove", "grove@localhost"),
            message: message.into(),
        }
    }
}

/// One reflog line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReflogEntry {
    pub old: ObjectId,
    pub new: ObjectId,
    pub who: Signature,
    pub message: String,
}

impl ReflogEntry {
    /// Serialize to a single line (no trailing newline).
    pub fn to_line(&self) -> String {
        // Messages are single-line in the log.
        let message = self.message.lines().next().unwrap_or("");
        format!(
            "{} {} {}\t{}",
            self.old,
            self.new,
            self.who.encode(),
            message
        )
    }

    /// Parse a reflog line.
    pub fn from_line(line: &str) -> Result<Self> {
        let bad = |reason: &str| Error::corrupt_object("reflog", reason.to_string());

        let (head, message) = line.split_once('\t').unwrap_or((line, ""));
        let mut parts = head.splitn(3, ' ');
        let old = parts.next().ok_or_else(|| bad("missing old id"))?;
        let new = parts.next().ok_or_else(|| bad("missing new id"))?;
        let who = parts.next().ok_or_else(|| bad("missing identity"))?;

        Ok(Self {
            old: ObjectId::from_hex(old).map_err(|_| bad("invalid old id"))?,
            new: ObjectId::from_hex(new).map_err(|_| bad("invalid new id"))?,
            who: Signature::parse(who).ok_or_else(|| bad("invalid identity"))?,
            message: message.to_string(),
        })
    }
}

/// Reflog directory of one repository.
#[derive(Debug, Clone)]
pub struct Reflog {
    logs_dir: PathBuf,
}

impl Reflog {
    /// Reflogs rooted at `logs_dir` (`<repo>/logs`).
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.logs_dir.join(name)
    }

    /// Append an entry to a ref's log, creating the file if needed.
    pub fn append(&self, name: &str, entry: &ReflogEntry) -> Result<()> {
        let path = self.log_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", entry.to_line())?;
        file.flush()?;
        Ok(())
    }

    /// Read up to `limit` entries, newest first. Unparseable lines are skipped.
    pub fn read_recent(&self, name: &str, limit: usize) -> Result<Vec<ReflogEntry>> {
        let path = self.log_path(name);
        if !path.is_file() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = ReflogEntry::from_line(&line) {
                entries.push(entry);
            }
        }

        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    /// Copy a ref's whole log into another reflog directory.
    pub fn copy_to(&self, name: &str, dest: &Reflog) -> Result<()> {
        let src = self.log_path(name);
        if !src.is_file() {
            return Ok(());
        }
        let dst = dest.log_path(name);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, &dst)?;
        Ok(())
    }
}
