mod logging;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use grove_core::{
    Change, Error, FileMode, MergeMethod, MergeOptions, MergeStrategy, RepoLayout, Repository,
    Signature, default_merge_message,
};
use logging::LogFormat;
use output::*;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Environment variable naming the storage root.
const ROOT_ENV: &str = "GROVE_ROOT";
const DEFAULT_ROOT: &str = "./grove-repos";
const DEFAULT_IDENTITY: &str = "grove <grove@localhost>";

/// Grove - Git-compatible bare repository storage
#[derive(Parser)]
#[command(name = "grove")]
#[command(about = "Bare Git repositories: objects, refs, commits and merges", long_about = None)]
#[command(version)]
struct Cli {
    /// Storage root directory (defaults to GROVE_ROOT env var or ./grove-repos)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new bare repository
    Init {
        /// Repository as owner/name
        repo: String,

        /// Branch HEAD points at
        #[arg(long, default_value = "main")]
        default_branch: String,
    },

    /// List repositories under the root
    List,

    /// Manage branches
    #[command(subcommand)]
    Branch(BranchCommands),

    /// Manage the staging area
    #[command(subcommand)]
    Stage(StageCommands),

    /// Commit staged changes onto the default branch
    Commit {
        repo: String,

        /// Commit message
        #[arg(short, long)]
        message: String,

        /// Author as "Name <email>"
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        author: String,
    },

    /// Print a file as of a ref
    Read {
        repo: String,
        reference: String,
        path: String,
    },

    /// List a directory as of a ref
    Ls {
        repo: String,
        reference: String,

        /// Directory path (the root when omitted)
        #[arg(default_value = "")]
        path: String,
    },

    /// Resolve a ref, short name or id to a commit id
    Resolve { repo: String, reference: String },

    /// First-parent history of a ref
    Log {
        repo: String,

        #[arg(default_value = "HEAD")]
        reference: String,

        /// Maximum number of commits
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Copy a repository with all its objects and refs
    Fork {
        repo: String,

        /// New repository as owner/name
        target: String,
    },

    /// Check whether a branch merges cleanly, without writing anything
    Mergeable {
        repo: String,
        source: String,
        target: String,
    },

    /// Merge a pull request branch into a target branch
    Merge {
        repo: String,
        source: String,
        target: String,

        #[arg(long, value_enum, default_value_t = StrategyArg::Merge)]
        strategy: StrategyArg,

        /// Pull request number, used in the default message
        #[arg(long, default_value_t = 0)]
        number: u64,

        /// Pull request title, used in the default message
        #[arg(long, default_value = "")]
        title: String,

        /// Message for merge and squash commits (overrides the default)
        #[arg(short, long)]
        message: Option<String>,

        /// Committer as "Name <email>"
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        committer: String,
    },

    /// List refs
    Refs {
        repo: String,

        #[arg(long, default_value = "refs/")]
        prefix: String,
    },

    /// Show recent transitions of a ref
    Reflog {
        repo: String,

        #[arg(default_value = "HEAD")]
        name: String,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Show or change the branch HEAD points at
    DefaultBranch {
        repo: String,

        /// Branch to point HEAD at
        #[arg(long)]
        set: Option<String>,
    },
}

#[derive(Subcommand)]
enum BranchCommands {
    /// Create a branch
    Create {
        repo: String,
        name: String,

        /// Ref to branch from (the default branch when omitted)
        #[arg(long)]
        from: Option<String>,

        /// Point HEAD at the new branch
        #[arg(long)]
        checkout: bool,
    },

    /// List branches
    List { repo: String },
}

#[derive(Subcommand)]
enum StageCommands {
    /// Stage files from a source directory (missing files stage deletions)
    Files {
        repo: String,

        /// Directory the paths are relative to
        #[arg(long, default_value = ".")]
        source: PathBuf,

        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Stage content for one path (reads stdin unless --text or --file)
    Content {
        repo: String,
        path: String,

        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        executable: bool,
    },

    /// Stage deletions
    Delete {
        repo: String,

        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Unstage paths, or everything when none are given
    Reset { repo: String, paths: Vec<String> },

    /// Show staged changes
    Show { repo: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Merge,
    Squash,
    Rebase,
}

impl From<StrategyArg> for MergeMethod {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Merge => MergeMethod::Merge,
            StrategyArg::Squash => MergeMethod::Squash,
            StrategyArg::Rebase => MergeMethod::Rebase,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);
    let out = OutputWriter::new(cli.json);

    // Storage root: CLI arg > GROVE_ROOT env var > ./grove-repos default
    let root = cli
        .root
        .or_else(|| std::env::var(ROOT_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
    let layout = RepoLayout::new(root);
    tracing::debug!(root = %layout.root().display(), "storage root");

    match run(cli.command, &layout, &out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let (code, conflicts) = classify(&err);
            out.write_error(&err, code, conflicts);
            ExitCode::from(code)
        }
    }
}

/// Exit code and conflicting paths for a failure.
fn classify(err: &anyhow::Error) -> (u8, Vec<String>) {
    match err.downcast_ref::<Error>() {
        Some(Error::MergeConflict { paths }) => (CONFLICT, paths.clone()),
        Some(e) if e.is_retriable() => (RETRY, Vec::new()),
        _ => (FAILED, Vec::new()),
    }
}

fn run(command: Commands, layout: &RepoLayout, out: &OutputWriter) -> Result<()> {
    match command {
        Commands::Init {
            repo,
            default_branch,
        } => cmd_init(layout, out, &repo, &default_branch),
        Commands::List => cmd_list(layout, out),
        Commands::Branch(branch_cmd) => match branch_cmd {
            BranchCommands::Create {
                repo,
                name,
                from,
                checkout,
            } => cmd_branch_create(layout, out, &repo, &name, from, checkout),
            BranchCommands::List { repo } => cmd_branch_list(layout, out, &repo),
        },
        Commands::Stage(stage_cmd) => match stage_cmd {
            StageCommands::Files {
                repo,
                source,
                paths,
            } => cmd_stage_files(layout, out, &repo, &source, &paths),
            StageCommands::Content {
                repo,
                path,
                text,
                file,
                executable,
            } => cmd_stage_content(layout, out, &repo, &path, text, file, executable),
            StageCommands::Delete { repo, paths } => cmd_stage_delete(layout, out, &repo, &paths),
            StageCommands::Reset { repo, paths } => cmd_stage_reset(layout, out, &repo, &paths),
            StageCommands::Show { repo } => cmd_stage_show(layout, out, &repo),
        },
        Commands::Commit {
            repo,
            message,
            author,
        } => cmd_commit(layout, out, &repo, &message, &author),
        Commands::Read {
            repo,
            reference,
            path,
        } => cmd_read(layout, out, &repo, &reference, &path),
        Commands::Ls {
            repo,
            reference,
            path,
        } => cmd_ls(layout, out, &repo, &reference, &path),
        Commands::Resolve { repo, reference } => cmd_resolve(layout, out, &repo, &reference),
        Commands::Log {
            repo,
            reference,
            limit,
        } => cmd_log(layout, out, &repo, &reference, limit),
        Commands::Fork { repo, target } => cmd_fork(layout, out, &repo, &target),
        Commands::Mergeable {
            repo,
            source,
            target,
        } => cmd_mergeable(layout, out, &repo, &source, &target),
        Commands::Merge {
            repo,
            source,
            target,
            strategy,
            number,
            title,
            message,
            committer,
        } => {
            let request = MergeRequest {
                source,
                target,
                method: strategy.into(),
                number,
                title,
                message,
                committer,
            };
            cmd_merge(layout, out, &repo, &request)
        }
        Commands::Refs { repo, prefix } => cmd_refs(layout, out, &repo, &prefix),
        Commands::Reflog { repo, name, limit } => cmd_reflog(layout, out, &repo, &name, limit),
        Commands::DefaultBranch { repo, set } => cmd_default_branch(layout, out, &repo, set),
    }
}

/// Split `owner/name`.
fn split_repo(repo_id: &str) -> Result<(&str, &str)> {
    repo_id.split_once('/')
        .filter(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'))
        .with_context(|| format!("Repository must be given as owner/name: {}", repo_id))
}

fn repo_path(layout: &RepoLayout, repo_id: &str) -> Result<PathBuf> {
    let (owner, name) = split_repo(repo_id)?;
    layout
        .repo_disk_path(owner, name)
        .with_context(|| format!("Invalid repository name: {}", repo_id))
}

fn open_repo(layout: &RepoLayout, repo_id: &str) -> Result<Repository> {
    let path = repo_path(layout, repo_id)?;
    Repository::open(&path).with_context(|| format!("Failed to open repository {}", repo_id))
}

/// Parse `Name <email>` into a signature stamped now.
fn parse_identity(text: &str) -> Result<Signature> {
    let (name, rest) = text
        .split_once('<')
        .with_context(|| format!("Identity must look like \"Name <email>\": {}", text))?;
    let email = rest
        .strip_suffix('>')
        .with_context(|| format!("Identity must look like \"Name <email>\": {}", text))?;
    let name = name.trim();
    if name.is_empty() || email.is_empty() {
        anyhow::bail!("Identity must look like \"Name <email>\": {}", text);
    }
    Ok(Signature::now(name, email.trim()))
}

fn cmd_init(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, default_branch: &str) -> Result<()> {
    let path = repo_path(layout, repo_id)?;
    Repository::init(&path, default_branch)
        .with_context(|| format!("Failed to initialize repository at {}", path.display()))?;

    let output = InitOutput {
        success: true,
        result_code: OK,
        repo: repo_id.to_string(),
        path: path.display().to_string(),
        default_branch: default_branch.to_string(),
    };
    out.write(&output, || {
        format!(
            "Initialized bare repository {} at {}\nDefault branch: {}\n",
            output.repo, output.path, output.default_branch
        )
    })
}

fn cmd_list(layout: &RepoLayout, out: &OutputWriter) -> Result<()> {
    let repos: Vec<RepoInfo> = layout
        .list()
        .with_context(|| format!("Failed to list repositories under {}", layout.root().display()))?
        .into_iter()
        .map(|(owner, name)| RepoInfo { owner, name })
        .collect();

    let output = RepoListOutput {
        success: true,
        result_code: OK,
        repos,
    };
    out.write(&output, || {
        if output.repos.is_empty() {
            return "No repositories\n".to_string();
        }
        output
            .repos
            .iter()
            .map(|r| format!("{}/{}\n", r.owner, r.name))
            .collect()
    })
}

fn cmd_branch_create(
    layout: &RepoLayout,
    out: &OutputWriter,
    repo_id: &str,
    name: &str,
    from: Option<String>,
    checkout: bool,
) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let from = match from {
        Some(from) => from,
        None => repo
            .default_branch()
            .with_context(|| "Failed to read default branch")?,
    };
    let sha = repo
        .create_branch(name, &from, checkout)
        .with_context(|| format!("Failed to create branch {} from {}", name, from))?;

    let output = BranchCreateOutput {
        success: true,
        result_code: OK,
        name: name.to_string(),
        sha,
        checkout,
    };
    out.write(&output, || format!("{} -> {}\n", output.name, output.sha))
}

fn cmd_branch_list(layout: &RepoLayout, out: &OutputWriter, repo_id: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let default_branch = repo
        .default_branch()
        .with_context(|| "Failed to read default branch")?;
    let branches = repo
        .refs()
        .list(grove_core::HEADS)
        .with_context(|| "Failed to list branches")?
        .into_iter()
        .map(|(full, sha)| {
            let name = full.trim_start_matches(grove_core::HEADS).to_string();
            BranchInfo {
                is_default: name == default_branch,
                name,
                sha,
            }
        })
        .collect();

    let output = BranchListOutput {
        success: true,
        result_code: OK,
        default_branch,
        branches,
    };
    out.write(&output, || {
        if output.branches.is_empty() {
            return format!("No branches (HEAD -> {})\n", output.default_branch);
        }
        output
            .branches
            .iter()
            .map(|b| {
                let marker = if b.is_default { '*' } else { ' ' };
                format!("{} {} {}\n", marker, b.sha.short(), b.name)
            })
            .collect()
    })
}

fn stage_output(out: &OutputWriter, action: &str, paths: Vec<String>) -> Result<()> {
    let output = StageOutput {
        success: true,
        result_code: OK,
        action: action.to_string(),
        paths,
    };
    out.write(&output, || {
        output
            .paths
            .iter()
            .map(|p| format!("{}: {}\n", output.action, p))
            .collect()
    })
}

fn cmd_stage_files(
    layout: &RepoLayout,
    out: &OutputWriter,
    repo_id: &str,
    source: &Path,
    paths: &[String],
) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let staged = repo
        .stage_files(source, paths)
        .with_context(|| format!("Failed to stage files from {}", source.display()))?;
    stage_output(out, "staged", staged)
}

fn cmd_stage_content(
    layout: &RepoLayout,
    out: &OutputWriter,
    repo_id: &str,
    path: &str,
    text: Option<String>,
    file: Option<PathBuf>,
    executable: bool,
) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let content = match (text, file) {
        (Some(text), _) => text.into_bytes(),
        (None, Some(file)) => std::fs::read(&file)
            .with_context(|| format!("Failed to read {}", file.display()))?,
        (None, None) => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .with_context(|| "Failed to read content from stdin")?;
            buf
        }
    };
    let mode = if executable {
        FileMode::Executable
    } else {
        FileMode::Regular
    };
    repo.stage_content(path, &content, mode)
        .with_context(|| format!("Failed to stage {}", path))?;
    stage_output(out, "staged", vec![path.to_string()])
}

fn cmd_stage_delete(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, paths: &[String]) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    for path in paths {
        repo.stage_deletion(path)
            .with_context(|| format!("Failed to stage deletion of {}", path))?;
    }
    stage_output(out, "deleted", paths.to_vec())
}

fn cmd_stage_reset(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, paths: &[String]) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    if paths.is_empty() {
        let staged: Vec<String> = repo
            .staged()
            .with_context(|| "Failed to read staging area")?
            .iter()
            .map(|(p, _)| p.to_string())
            .collect();
        repo.clear_stage()
            .with_context(|| "Failed to clear staging area")?;
        return stage_output(out, "unstaged", staged);
    }
    repo.unstage(paths)
        .with_context(|| "Failed to unstage paths")?;
    stage_output(out, "unstaged", paths.to_vec())
}

fn cmd_stage_show(layout: &RepoLayout, out: &OutputWriter, repo_id: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let changes = repo
        .staged()
        .with_context(|| "Failed to read staging area")?
        .iter()
        .map(|(path, change)| match change {
            Change::Write { blob, mode } => StagedChange {
                path: path.to_string(),
                op: "write".to_string(),
                blob: Some(*blob),
                mode: Some(mode.as_str().to_string()),
            },
            Change::Delete => StagedChange {
                path: path.to_string(),
                op: "delete".to_string(),
                blob: None,
                mode: None,
            },
        })
        .collect();

    let output = StageShowOutput {
        success: true,
        result_code: OK,
        changes,
    };
    out.write(&output, || {
        if output.changes.is_empty() {
            return "Nothing staged\n".to_string();
        }
        output
            .changes
            .iter()
            .map(|c| match c.blob {
                Some(blob) => format!("W {} {} {}\n", c.mode.as_deref().unwrap_or(""), blob.short(), c.path),
                None => format!("D {}\n", c.path),
            })
            .collect()
    })
}

fn cmd_commit(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, message: &str, author: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let author = parse_identity(author)?;
    let branch = repo
        .default_branch()
        .with_context(|| "Failed to read default branch")?;
    let sha = repo
        .create_commit(message, &author)
        .with_context(|| format!("Failed to commit to {}", branch))?;

    let output = CommitOutput {
        success: true,
        result_code: OK,
        branch,
        sha,
    };
    out.write(&output, || format!("[{} {}] {}\n", output.branch, output.sha.short(), message))
}

fn cmd_read(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, reference: &str, path: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let file = repo
        .read_file_at_ref(reference, path)
        .with_context(|| format!("Failed to read {} at {}", path, reference))?;

    if !out.is_json() {
        return out.write_raw(&file.content);
    }
    let content = file.content_utf8().map(str::to_string);
    let output = ReadOutput {
        success: true,
        result_code: OK,
        reference: reference.to_string(),
        file,
        content,
    };
    out.write(&output, String::new)
}

fn cmd_ls(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, reference: &str, path: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let entries = repo
        .list_tree_at_ref(reference, path)
        .with_context(|| format!("Failed to list {:?} at {}", path, reference))?
        .into_iter()
        .map(|e| TreeEntryInfo {
            kind: if e.mode.is_tree() {
                "tree"
            } else if e.mode == FileMode::Gitlink {
                "commit"
            } else {
                "blob"
            }
            .to_string(),
            mode: e.mode.to_string(),
            id: e.id,
            name: e.name,
        })
        .collect();

    let output = LsOutput {
        success: true,
        result_code: OK,
        reference: reference.to_string(),
        path: path.to_string(),
        entries,
    };
    out.write(&output, || {
        output
            .entries
            .iter()
            .map(|e| format!("{} {} {}\t{}\n", e.mode, e.kind, e.id, e.name))
            .collect()
    })
}

fn cmd_resolve(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, reference: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let sha = repo
        .resolve_ref(reference)
        .with_context(|| format!("Failed to resolve {}", reference))?;

    let output = ResolveOutput {
        success: true,
        result_code: OK,
        reference: reference.to_string(),
        sha,
    };
    out.write(&output, || format!("{}\n", output.sha))
}

fn cmd_log(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, reference: &str, limit: usize) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let commits = repo
        .log(reference, limit)
        .with_context(|| format!("Failed to read history of {}", reference))?
        .into_iter()
        .map(|(sha, commit)| CommitInfo {
            sha,
            date: commit.author.datetime(),
            summary: commit.summary(),
            parents: commit.parents,
            author: commit.author,
            committer: commit.committer,
        })
        .collect();

    let output = LogOutput {
        success: true,
        result_code: OK,
        reference: reference.to_string(),
        commits,
    };
    out.write(&output, || {
        output
            .commits
            .iter()
            .map(|c| {
                let date = c
                    .date
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S %z").to_string())
                    .unwrap_or_default();
                format!("{} {} {} {}\n", c.sha.short(), date, c.author.name, c.summary)
            })
            .collect()
    })
}

fn cmd_fork(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, target: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let target_path = repo_path(layout, target)?;
    let summary = repo
        .fork(&target_path)
        .with_context(|| format!("Failed to fork {} into {}", repo_id, target))?;

    let output = ForkOutput {
        success: true,
        result_code: OK,
        source: repo_id.to_string(),
        target: target.to_string(),
        summary,
    };
    out.write(&output, || {
        format!(
            "Forked {} into {}\nDefault branch: {}\nBranches: {}\nTags: {}\nObjects copied: {}\n",
            output.source,
            output.target,
            output.summary.default_branch,
            output.summary.branches.join(", "),
            output.summary.tags.join(", "),
            output.summary.objects_copied
        )
    })
}

fn cmd_mergeable(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, source: &str, target: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let check = repo
        .check_mergeability(source, target)
        .with_context(|| format!("Failed to check merging {} into {}", source, target))?;

    let output = MergeableOutput {
        success: true,
        result_code: OK,
        source: source.to_string(),
        target: target.to_string(),
        check,
    };
    out.write(&output, || {
        let check = &output.check;
        let mut text = format!(
            "can merge: {}\nahead by: {}\nbehind by: {}\nfast-forward: {}\n",
            check.can_merge, check.ahead_by, check.behind_by, check.fast_forward
        );
        match check.merge_base {
            Some(base) => text.push_str(&format!("merge base: {}\n", base)),
            None => text.push_str("merge base: none (unrelated histories)\n"),
        }
        for path in &check.conflicts {
            text.push_str(&format!("conflict: {}\n", path));
        }
        text
    })
}

/// Arguments of `merge`.
struct MergeRequest {
    source: String,
    target: String,
    method: MergeMethod,
    number: u64,
    title: String,
    message: Option<String>,
    committer: String,
}

impl MergeRequest {
    fn strategy(&self) -> MergeStrategy {
        let message = || {
            self.message.clone().unwrap_or_else(|| {
                default_merge_message(self.number, &self.title, &self.source, &self.target, self.method)
            })
        };
        match self.method {
            MergeMethod::Merge => MergeStrategy::Merge { message: message() },
            MergeMethod::Squash => MergeStrategy::Squash { message: message() },
            MergeMethod::Rebase => MergeStrategy::Rebase,
        }
    }
}

fn cmd_merge(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, request: &MergeRequest) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let options = MergeOptions {
        committer: parse_identity(&request.committer)?,
        strategy: request.strategy(),
    };
    let outcome = repo
        .merge_pull_request(&request.source, &request.target, &options)
        .with_context(|| {
            format!(
                "Failed to {} {} into {}",
                request.method, request.source, request.target
            )
        })?;

    let output = MergeOutput {
        success: true,
        result_code: OK,
        source: request.source.clone(),
        target: request.target.clone(),
        method: request.method,
        outcome,
    };
    out.write(&output, || {
        format!(
            "{} -> {} ({:?})\n",
            output.target, output.outcome.sha, output.outcome.kind
        )
    })
}

fn cmd_refs(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, prefix: &str) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let head = repo
        .refs()
        .read_symbolic("HEAD")
        .with_context(|| "Failed to read HEAD")?;
    let refs = repo
        .refs()
        .list(prefix)
        .with_context(|| format!("Failed to list refs under {}", prefix))?
        .into_iter()
        .map(|(name, sha)| RefInfo { name, sha })
        .collect();

    let output = RefsOutput {
        success: true,
        result_code: OK,
        head,
        refs,
    };
    out.write(&output, || {
        let mut text = String::new();
        if let Some(head) = &output.head {
            text.push_str(&format!("HEAD -> {}\n", head));
        }
        for r in &output.refs {
            text.push_str(&format!("{} {}\n", r.sha, r.name));
        }
        text
    })
}

fn cmd_reflog(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, name: &str, limit: usize) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let entries = repo
        .refs()
        .read_reflog(name, limit)
        .with_context(|| format!("Failed to read reflog of {}", name))?;

    let output = ReflogOutput {
        success: true,
        result_code: OK,
        name: name.to_string(),
        entries,
    };
    out.write(&output, || {
        output
            .entries
            .iter()
            .map(|e| format!("{} {} {}\n", e.new.short(), e.who.name, e.message))
            .collect()
    })
}

fn cmd_default_branch(layout: &RepoLayout, out: &OutputWriter, repo_id: &str, set: Option<String>) -> Result<()> {
    let repo = open_repo(layout, repo_id)?;
    let changed = set.is_some();
    if let Some(branch) = &set {
        repo.set_default_branch(branch)
            .with_context(|| format!("Failed to set default branch to {}", branch))?;
    }
    let default_branch = repo
        .default_branch()
        .with_context(|| "Failed to read default branch")?;

    let output = DefaultBranchOutput {
        success: true,
        result_code: OK,
        default_branch,
        changed,
    };
    out.write(&output, || format!("{}\n", output.default_branch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_split_repo() {
        assert_eq!(split_repo("alice/demo").unwrap(), ("alice", "demo"));
        assert!(split_repo("demo").is_err());
        assert!(split_repo("alice/").is_err());
        assert!(split_repo("a/b/c").is_err());
    }

    #[test]
    fn test_parse_identity() {
        let sig = parse_identity("Alice Smith <alice@example.com>").unwrap();
        assert_eq!(sig.name, "Alice Smith");
        assert_eq!(sig.email, "alice@example.com");
        assert!(parse_identity("no email").is_err());
        assert!(parse_identity("<only@email>").is_err());
    }

    #[test]
    fn test_default_message_used_unless_overridden() {
        let mut request = MergeRequest {
            source: "feature".to_string(),
            target: "main".to_string(),
            method: MergeMethod::Squash,
            number: 12,
            title: "Add thing".to_string(),
            message: None,
            committer: DEFAULT_IDENTITY.to_string(),
        };
        match request.strategy() {
            MergeStrategy::Squash { message } => assert!(message.contains("#12")),
            other => panic!("unexpected strategy {:?}", other),
        }
        request.message = Some("custom".to_string());
        assert_eq!(
            request.strategy(),
            MergeStrategy::Squash {
                message: "custom".to_string()
            }
        );
    }

    #[test]
    fn test_classify_conflicts_and_races() {
        let conflict = anyhow::Error::new(Error::merge_conflict(vec!["a.txt".to_string()]))
            .context("Failed to merge");
        assert_eq!(classify(&conflict), (CONFLICT, vec!["a.txt".to_string()]));

        let race = anyhow::Error::new(Error::non_fast_forward("main"));
        assert_eq!(classify(&race).0, RETRY);

        assert_eq!(classify(&anyhow::anyhow!("other")).0, FAILED);
    }

    #[test]
    fn test_end_to_end_merge() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let layout = RepoLayout::new(temp_dir.path());
        let out = OutputWriter::new(true);

        cmd_init(&layout, &out, "alice/demo", "main").unwrap();
        let repo = open_repo(&layout, "alice/demo").unwrap();
        repo.stage_content("README", b"A", FileMode::Regular).unwrap();
        cmd_commit(&layout, &out, "alice/demo", "first", DEFAULT_IDENTITY).unwrap();
        cmd_branch_create(&layout, &out, "alice/demo", "feature", None, false).unwrap();

        let sig = Signature::now("Bob", "bob@example.com");
        let mut changes = grove_core::Changeset::new();
        let blob = repo.objects().put_blob(b"B").unwrap();
        changes.write("README", blob, FileMode::Regular).unwrap();
        let tip = repo
            .commit_changes("feature", &changes, "second", &sig, &sig)
            .unwrap();

        let request = MergeRequest {
            source: "feature".to_string(),
            target: "main".to_string(),
            method: MergeMethod::Merge,
            number: 1,
            title: "t".to_string(),
            message: None,
            committer: DEFAULT_IDENTITY.to_string(),
        };
        cmd_merge(&layout, &out, "alice/demo", &request).unwrap();
        assert_eq!(repo.resolve_ref("main").unwrap(), tip);

        cmd_fork(&layout, &out, "alice/demo", "bob/demo").unwrap();
        let fork = open_repo(&layout, "bob/demo").unwrap();
        assert_eq!(fork.resolve_ref("main").unwrap(), tip);
    }
}
