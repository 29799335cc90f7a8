//! Output formatting for CLI commands.
//!
//! Every command produces one serializable result. In JSON mode it is printed
//! as-is; in text mode a closure renders it for humans.

use anyhow::Result;
use chrono::{DateTime, FixedOffset};
use grove_core::{
    FileAtRef, ForkSummary, MergeMethod, MergeOutcome, Mergeability, ObjectId, ReflogEntry,
    Signature,
};
use serde::Serialize;
use std::io::{self, Write};

/// Exit code for success.
pub const OK: u8 = 0;
/// Exit code for any failure not listed below.
pub const FAILED: u8 = 1;
/// Exit code for merge conflicts.
pub const CONFLICT: u8 = 2;
/// Exit code for retriable failures (ref or stage raced by another writer).
pub const RETRY: u8 = 3;

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write `data` as JSON, or the result of `text_fn` in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write raw bytes to stdout (text mode `read`).
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut handle = self.stdout.lock();
        handle.write_all(bytes)?;
        handle.flush()?;
        Ok(())
    }

    /// Report a failure on stderr.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8, conflicts: Vec<String>) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                    retriable: result_code == RETRY,
                    conflicts,
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
                for path in conflicts {
                    let _ = writeln!(io::stderr(), "  conflict: {}", path);
                }
            }
        }
    }
}

// Data transfer objects for JSON output.

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
}

/// Output for `init`.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub repo: String,
    pub path: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoInfo {
    pub owner: String,
    pub name: String,
}

/// Output for `list`.
#[derive(Debug, Serialize)]
pub struct RepoListOutput {
    pub success: bool,
    pub result_code: u8,
    pub repos: Vec<RepoInfo>,
}

/// Output for `branch create`.
#[derive(Debug, Serialize)]
pub struct BranchCreateOutput {
    pub success: bool,
    pub result_code: u8,
    pub name: String,
    pub sha: ObjectId,
    pub checkout: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub name: String,
    pub sha: ObjectId,
    pub is_default: bool,
}

/// Output for `branch list`.
#[derive(Debug, Serialize)]
pub struct BranchListOutput {
    pub success: bool,
    pub result_code: u8,
    pub default_branch: String,
    pub branches: Vec<BranchInfo>,
}

/// Output for the `stage` subcommands that change the stage.
#[derive(Debug, Serialize)]
pub struct StageOutput {
    pub success: bool,
    pub result_code: u8,
    pub action: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedChange {
    pub path: String,
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<ObjectId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Output for `stage show`.
#[derive(Debug, Serialize)]
pub struct StageShowOutput {
    pub success: bool,
    pub result_code: u8,
    pub changes: Vec<StagedChange>,
}

/// Output for `commit`.
#[derive(Debug, Serialize)]
pub struct CommitOutput {
    pub success: bool,
    pub result_code: u8,
    pub branch: String,
    pub sha: ObjectId,
}

/// Output for `read`.
#[derive(Debug, Serialize)]
pub struct ReadOutput {
    pub success: bool,
    pub result_code: u8,
    pub reference: String,
    #[serde(flatten)]
    pub file: FileAtRef,
    /// Content when it is valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeEntryInfo {
    pub name: String,
    pub mode: String,
    pub kind: String,
    pub id: ObjectId,
}

/// Output for `ls`.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    pub reference: String,
    pub path: String,
    pub entries: Vec<TreeEntryInfo>,
}

/// Output for `resolve`.
#[derive(Debug, Serialize)]
pub struct ResolveOutput {
    pub success: bool,
    pub result_code: u8,
    pub reference: String,
    pub sha: ObjectId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub sha: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    /// Author date in the author's own offset.
    pub date: Option<DateTime<FixedOffset>>,
    pub summary: String,
}

/// Output for `log`.
#[derive(Debug, Serialize)]
pub struct LogOutput {
    pub success: bool,
    pub result_code: u8,
    pub reference: String,
    pub commits: Vec<CommitInfo>,
}

/// Output for `fork`.
#[derive(Debug, Serialize)]
pub struct ForkOutput {
    pub success: bool,
    pub result_code: u8,
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub summary: ForkSummary,
}

/// Output for `mergeable`.
#[derive(Debug, Serialize)]
pub struct MergeableOutput {
    pub success: bool,
    pub result_code: u8,
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub check: Mergeability,
}

/// Output for `merge`.
#[derive(Debug, Serialize)]
pub struct MergeOutput {
    pub success: bool,
    pub result_code: u8,
    pub source: String,
    pub target: String,
    pub method: MergeMethod,
    #[serde(flatten)]
    pub outcome: MergeOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefInfo {
    pub name: String,
    pub sha: ObjectId,
}

/// Output for `refs`.
#[derive(Debug, Serialize)]
pub struct RefsOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    pub refs: Vec<RefInfo>,
}

/// Output for `reflog`.
#[derive(Debug, Serialize)]
pub struct ReflogOutput {
    pub success: bool,
    pub result_code: u8,
    pub name: String,
    pub entries: Vec<ReflogEntry>,
}

/// Output for `default-branch`.
#[derive(Debug, Serialize)]
pub struct DefaultBranchOutput {
    pub success: bool,
    pub result_code: u8,
    pub default_branch: String,
    pub changed: bool,
}
