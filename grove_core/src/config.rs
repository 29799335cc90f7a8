//! Repository configuration (`<repo>/config`, Git INI syntax).
//!
//! Only the keys the engine acts on are interpreted; everything else in the
//! file is left alone so external Git clients can keep their settings there.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Default zlib level for loose objects (Git's `core.compression` default).
pub const DEFAULT_COMPRESSION: u32 = 6;

/// Settings read from a repository's `config` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    /// `core.repositoryformatversion`; only 0 is supported.
    pub format_version: u32,
    /// `core.bare`; must be true.
    pub bare: bool,
    /// `core.compression` (0-9).
    pub compression: u32,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            format_version: 0,
            bare: true,
            compression: DEFAULT_COMPRESSION,
        }
    }
}

impl RepoConfig {
    /// Read and validate `<root>/config`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config");
        if !path.exists() {
            return Err(Error::invalid_repository(root, "config file not found"));
        }
        let content = fs::read_to_string(&path)?;
        Self::parse(&content).map_err(|reason| Error::invalid_repository(root, reason))
    }

    /// Write the canonical file for a fresh repository.
    pub fn write_new(&self, root: &Path) -> Result<()> {
        fs::write(root.join("config"), self.render())?;
        Ok(())
    }

    /// Parse config text, returning a human-readable reason on failure.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let values = parse_ini(content)?;
        let get = |key: &str| values.get(key).map(String::as_str);

        let format_version = match get("core.repositoryformatversion") {
            Some(v) => v
                .parse::<u32>()
                .map_err(|_| format!("invalid core.repositoryformatversion {:?}", v))?,
            None => 0,
        };
        if format_version != 0 {
            return Err(format!(
                "unsupported repository format version {}",
                format_version
            ));
        }

        let bare = match get("core.bare") {
            Some(v) => parse_bool(v).ok_or_else(|| format!("invalid core.bare {:?}", v))?,
            None => false,
        };
        if !bare {
            return Err("repository is not bare (core.bare must be true)".to_string());
        }

        let compression = match get("core.compression") {
            Some(v) => match v.parse::<i32>() {
                // Git treats -1 as "zlib default".
                Ok(-1) => DEFAULT_COMPRESSION,
                Ok(level @ 0..=9) => level as u32,
                _ => return Err(format!("invalid core.compression {:?}", v)),
            },
            None => DEFAULT_COMPRESSION,
        };

        Ok(Self {
            format_version,
            bare,
            compression,
        })
    }

    /// Render as Git writes it for `git init --bare`.
    pub fn render(&self) -> String {
        let mut out = String::from("[core]\n");
        out.push_str(&format!(
            "\trepositoryformatversion = {}\n",
            self.format_version
        ));
        out.push_str("\tfilemode = true\n");
        out.push_str(&format!("\tbare = {}\n", self.bare));
        if self.compression != DEFAULT_COMPRESSION {
            out.push_str(&format!("\tcompression = {}\n", self.compression));
        }
        out
    }
}

/// Flatten `[section]` / `[section "sub"]` + `key = value` lines into
/// `section.key` / `section.sub.key` (section and key lowercased).
fn parse_ini(content: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut values = BTreeMap::new();
    let mut section: Option<String> = None;

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let header = header
                .strip_suffix(']')
                .ok_or_else(|| format!("line {}: unterminated section header", lineno + 1))?;
            section = Some(match header.split_once(' ') {
                Some((name, sub)) => format!(
                    "{}.{}",
                    name.trim().to_ascii_lowercase(),
                    sub.trim().trim_matches('"')
                ),
                None => header.trim().to_ascii_lowercase(),
            });
            continue;
        }

        let current = section
            .as_ref()
            .ok_or_else(|| format!("line {}: key outside of any section", lineno + 1))?;

        // A bare key means boolean true.
        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), strip_inline_comment(v.trim())),
            None => (line, "true".to_string()),
        };
        values.insert(
            format!("{}.{}", current, key.to_ascii_lowercase()),
            value,
        );
    }

    Ok(values)
}

fn strip_inline_comment(value: &str) -> String {
    if value.starts_with('"') {
        return value.trim_matches('"').to_string();
    }
    value
        .split(['#', ';'])
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" | "" => Some(false),
        _ => None,
    }
}
