//! fox: command-line client for FoxNest.
//!
//! # Usage
//!
//! ```bash
//! fox init --user alice --name notes
//! fox add --all
//! fox commit -m "first draft"
//! fox set origin localhost:5000
//! fox push
//! fox pull
//! fox push --archive
//! ```

mod remote;

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use foxnest_core::sync::{archive_remote, remote_info, unarchive_remote};
use foxnest_core::{
    pull, push, Commit, FoxError, ObjectId, PullOutcome, PushOutcome, Workspace, WorkspaceStatus,
};
use remote::HttpRemote;

#[derive(Parser, Debug)]
#[command(name = "fox")]
#[command(author = "FoxNest Contributors")]
#[command(version = "0.1.0")]
#[command(about = "FoxNest version control client")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a repository in the current directory
    Init {
        /// Author name
        #[arg(long)]
        user: String,
        /// Repository name
        #[arg(long)]
        name: String,
    },

    /// Stage files or directories for the next commit
    Add {
        /// Stage every change in the workspace
        #[arg(long)]
        all: bool,
        paths: Vec<PathBuf>,
    },

    /// Record the staged changes
    Commit {
        #[arg(short, long)]
        message: String,
    },

    /// Show staged, modified, untracked and deleted files
    Status {
        /// One line per file with a two-letter code
        #[arg(short, long)]
        short: bool,
    },

    /// Show commit history
    Log {
        /// Number of commits to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Short id and first message line only
        #[arg(long)]
        oneline: bool,
    },

    /// Send local commits to origin
    Push {
        /// Archive the server repository after the push
        #[arg(long)]
        archive: bool,
    },

    /// Fetch commits from origin and update the working files
    Pull,

    /// Pack loose objects now
    Gc,

    /// Change a setting
    Set {
        #[command(subcommand)]
        setting: Setting,
    },

    /// Archive the repository on origin (no further pushes)
    Archive {
        #[arg(short, long, default_value = "archived from client")]
        reason: String,
    },

    /// Reopen an archived repository on origin
    Unarchive,

    /// Storage statistics, local and remote
    Stats,
}

#[derive(Subcommand, Debug)]
enum Setting {
    /// Server URL, e.g. `localhost:5000` or `http://host:5000`
    Origin { url: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let cwd = env::current_dir().context("Cannot determine the current directory")?;
    match cli.command {
        Commands::Init { user, name } => cmd_init(&cwd, &user, &name),
        Commands::Add { all, paths } => cmd_add(&cwd, all, &paths),
        Commands::Commit { message } => cmd_commit(&cwd, &message),
        Commands::Status { short } => cmd_status(&cwd, short),
        Commands::Log { limit, oneline } => cmd_log(&cwd, limit, oneline),
        Commands::Push { archive } => cmd_push(&cwd, archive),
        Commands::Pull => cmd_pull(&cwd),
        Commands::Gc => cmd_gc(&cwd),
        Commands::Set {
            setting: Setting::Origin { url },
        } => cmd_set_origin(&cwd, &url),
        Commands::Archive { reason } => cmd_archive(&cwd, &reason),
        Commands::Unarchive => cmd_unarchive(&cwd),
        Commands::Stats => cmd_stats(&cwd),
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn open_workspace(cwd: &Path) -> Result<Workspace> {
    Workspace::discover(cwd).context("Not a fox repository (run `fox init` first)")
}

/// The origin remote and repository id of a workspace
fn origin(workspace: &Workspace) -> Result<(HttpRemote, String)> {
    let Some(url) = workspace.config().remote.clone() else {
        bail!("No origin configured (run `fox set origin URL`)");
    };
    let remote = HttpRemote::new(&url)?;
    Ok((remote, workspace.config().repo_id.clone()))
}

fn cmd_init(cwd: &Path, user: &str, name: &str) -> Result<()> {
    let workspace = Workspace::init(cwd, name, user)
        .with_context(|| format!("Failed to initialize repository in {}", cwd.display()))?;
    println!("Initialized empty repository {:?} in {}", name, workspace.root().display());
    println!("  Repository id: {}", workspace.config().repo_id);
    Ok(())
}

fn cmd_add(cwd: &Path, all: bool, paths: &[PathBuf]) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let staged = if all {
        workspace.add_all()?
    } else {
        if paths.is_empty() {
            bail!("Nothing specified, nothing added (use `fox add --all` or name paths)");
        }
        let absolute: Vec<PathBuf> = paths.iter().map(|p| cwd.join(p)).collect();
        workspace.add(&absolute)?
    };
    for path in &staged {
        println!("  staged {}", path);
    }
    println!("{} path(s) staged", staged.len());
    Ok(())
}

fn cmd_commit(cwd: &Path, message: &str) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    match workspace.commit(message) {
        Ok(id) => {
            println!("[{}] {}", id.short(), message);
            Ok(())
        }
        Err(FoxError::NothingToCommit) => {
            println!("Nothing to commit");
            Ok(())
        }
        Err(e) => Err(e).context("Commit failed"),
    }
}

fn cmd_status(cwd: &Path, short: bool) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let status = workspace.status()?;
    if short {
        print!("{}", format_status_short(&status));
    } else {
        print!("{}", format_status(&status));
    }
    Ok(())
}

/// `A ` staged, ` M` modified, ` D` deleted, `??` untracked
fn format_status_short(status: &WorkspaceStatus) -> String {
    let sections = [
        ("A ", &status.staged),
        (" M", &status.modified),
        (" D", &status.deleted),
        ("??", &status.untracked),
    ];
    let mut out = String::new();
    for (code, paths) in sections {
        for path in paths {
            out.push_str(&format!("{} {}\n", code, path));
        }
    }
    out
}

fn format_status(status: &WorkspaceStatus) -> String {
    if status.is_clean() {
        return "Nothing to commit, working tree clean\n".to_string();
    }
    let mut out = String::new();
    let sections = [
        ("Changes to be committed:", &status.staged),
        ("Modified:", &status.modified),
        ("Deleted:", &status.deleted),
        ("Untracked files:", &status.untracked),
    ];
    for (title, paths) in sections {
        if paths.is_empty() {
            continue;
        }
        out.push_str(title);
        out.push('\n');
        for path in paths {
            out.push_str(&format!("  {}\n", path));
        }
    }
    out
}

fn cmd_log(cwd: &Path, limit: Option<usize>, oneline: bool) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let history = workspace.repository().log(limit)?;
    if history.is_empty() {
        println!("No commits yet");
        return Ok(());
    }
    print!("{}", format_log(&history, oneline));
    Ok(())
}

fn format_log(history: &[(ObjectId, Commit)], oneline: bool) -> String {
    let mut out = String::new();
    for (id, commit) in history {
        if oneline {
            let subject = commit.message.lines().next().unwrap_or("");
            out.push_str(&format!("{} {}\n", id.short(), subject));
            continue;
        }
        let date = Utc
            .timestamp_opt(commit.timestamp, 0)
            .single()
            .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| commit.timestamp.to_string());
        out.push_str(&format!("commit {}\n", id));
        out.push_str(&format!("Author: {}\n", commit.author));
        out.push_str(&format!("Date:   {}\n\n", date));
        out.push_str(&format!("    {}\n\n", commit.message));
    }
    out
}

fn cmd_push(cwd: &Path, archive: bool) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let (remote, repo_id) = origin(&workspace)?;
    let outcome = match push(workspace.repository(), &remote, &repo_id, archive) {
        Ok(outcome) => outcome,
        Err(FoxError::RepositoryArchived(_)) => {
            bail!("Repository {} is archived on {}; unarchive it to push again", repo_id, remote.base_url())
        }
        Err(e) => return Err(e).with_context(|| format!("Push to {} failed", remote.base_url())),
    };
    match outcome {
        PushOutcome::UpToDate { head, archived } => {
            println!("Everything up-to-date ({})", head.short());
            if archived {
                println!("Repository archived");
            }
        }
        PushOutcome::Applied {
            head,
            objects_sent,
            objects_written,
            archived,
        } => {
            println!(
                "Pushed {} objects ({} new on server), head is now {}",
                objects_sent,
                objects_written,
                head.short()
            );
            if archived {
                println!("All commits pushed and repository archived");
            }
        }
    }
    Ok(())
}

fn cmd_pull(cwd: &Path) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let (remote, repo_id) = origin(&workspace)?;
    let outcome = pull(workspace.repository(), &remote, &repo_id)
        .with_context(|| format!("Pull from {} failed", remote.base_url()))?;
    match outcome {
        PullOutcome::UpToDate { .. } => println!("Already up-to-date"),
        PullOutcome::Applied {
            previous,
            head,
            objects_received,
            ..
        } => {
            let written = workspace.checkout_head(previous)?;
            println!(
                "Received {} objects, head is now {} ({} files updated)",
                objects_received,
                head.short(),
                written
            );
        }
    }
    Ok(())
}

fn cmd_gc(cwd: &Path) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let report = workspace.repository().gc().context("Garbage collection failed")?;
    match &report.pack {
        Some(pack) => println!(
            "Packed {} objects ({} deltas) into {}, removed {} loose files",
            report.packed, report.deltas, pack, report.loose_removed
        ),
        None => println!("Nothing to pack ({} reachable objects)", report.reachable),
    }
    println!(
        "Storage: {} -> {} ({} ms)",
        format_size(report.bytes_before),
        format_size(report.bytes_after),
        report.elapsed_ms
    );
    Ok(())
}

fn cmd_set_origin(cwd: &Path, url: &str) -> Result<()> {
    let mut workspace = open_workspace(cwd)?;
    let normalized = workspace.set_remote(url)?;
    println!("Origin set to {}", normalized);
    Ok(())
}

fn cmd_archive(cwd: &Path, reason: &str) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let (remote, repo_id) = origin(&workspace)?;
    match archive_remote(&remote, &repo_id, reason) {
        Ok(_) => println!("Repository {} archived: {}", repo_id, reason),
        Err(FoxError::AlreadyArchived) => println!("Repository {} is already archived", repo_id),
        Err(e) => return Err(e).context("Archive failed"),
    }
    Ok(())
}

fn cmd_unarchive(cwd: &Path) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let (remote, repo_id) = origin(&workspace)?;
    match unarchive_remote(&remote, &repo_id) {
        Ok(_) => println!("Repository {} unarchived", repo_id),
        Err(FoxError::NotArchived) => println!("Repository {} is not archived", repo_id),
        Err(e) => return Err(e).context("Unarchive failed"),
    }
    Ok(())
}

fn cmd_stats(cwd: &Path) -> Result<()> {
    let workspace = open_workspace(cwd)?;
    let stats = workspace.repository().stats()?;
    let storage = &stats.storage;
    println!("Repository: {} ({})", workspace.config().name, workspace.config().repo_id);
    println!(
        "Head:       {}",
        stats.head.map(|h| h.short()).unwrap_or_else(|| "(empty)".into())
    );
    println!("Commits:    {}", stats.commits);
    println!(
        "Loose:      {} objects, {}",
        storage.loose_objects,
        format_size(storage.loose_bytes)
    );
    println!(
        "Packed:     {} objects in {} pack(s), {}",
        storage.packed_objects,
        storage.packs,
        format_size(storage.pack_bytes)
    );
    println!("Total:      {}", format_size(storage.total_bytes()));

    if let Ok((remote, repo_id)) = origin(&workspace) {
        match remote_info(&remote, &repo_id) {
            Ok(info) => {
                println!(
                    "Origin:     {} head {}{}",
                    remote.base_url(),
                    info.server_head.map(|h| h.short()).unwrap_or_else(|| "(empty)".into()),
                    if info.archived { ", archived" } else { "" }
                );
            }
            Err(FoxError::RepositoryNotFound(_)) => println!("Origin:     {} (not pushed yet)", remote.base_url()),
            Err(e) => println!("Origin:     {} unreachable: {}", remote.base_url(), e),
        }
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
