use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

/// Upper bound for each git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened to the workspace after a cancelled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack,
    NothingToRollBack,
    NotARepository,
    Failed(String),
}

impl std::fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackOutcome::RolledBack => write!(f, "changes rolled back"),
            RollbackOutcome::NothingToRollBack => write!(f, "no changes to roll back"),
            RollbackOutcome::NotARepository => write!(f, "workspace is not a git repository"),
            RollbackOutcome::Failed(reason) => write!(f, "rollback failed: {}", reason),
        }
    }
}

/// Discard uncommitted changes in `workspace`: tracked files are checked out
/// again and untracked files removed. Never fails; problems come back as
/// `RollbackOutcome::Failed`.
pub async fn rollback(workspace: &Path) -> RollbackOutcome {
    let status = match git(workspace, &["status", "--porcelain"]).await {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not a git repository") {
                tracing::info!("skipping rollback, {} is not a git repository", workspace.display());
                return RollbackOutcome::NotARepository;
            }
            return failed(format!("git status: {}", stderr.trim()));
        }
        Err(reason) => return failed(reason),
    };

    let listing = String::from_utf8_lossy(&status.stdout);
    if listing.trim().is_empty() {
        return RollbackOutcome::NothingToRollBack;
    }

    // Untracked entries start with "??"; anything else touches a tracked path.
    let has_tracked = listing
        .lines()
        .any(|line| !line.trim().is_empty() && !line.starts_with("??"));
    if has_tracked {
        if let Some(outcome) = run_step(workspace, &["checkout", "--", "."]).await {
            return outcome;
        }
    }
    if let Some(outcome) = run_step(workspace, &["clean", "-fd"]).await {
        return outcome;
    }

    tracing::info!("rolled back workspace {}", workspace.display());
    RollbackOutcome::RolledBack
}

/// Run one mutating git step; `Some` carries the failure.
async fn run_step(workspace: &Path, args: &[&str]) -> Option<RollbackOutcome> {
    match git(workspace, args).await {
        Ok(output) if output.status.success() => None,
        Ok(output) => Some(failed(format!(
            "git {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        Err(reason) => Some(failed(reason)),
    }
}

/// What `git diff` showed for a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOutcome {
    Changes(String),
    Clean,
    NotARepository,
    Failed(String),
}

/// Unstaged changes in `workspace`, or the staged ones when nothing is
/// unstaged. `pattern` limits the diff to paths containing it.
pub async fn diff(workspace: &Path, pattern: Option<&str>) -> DiffOutcome {
    match git(workspace, &["rev-parse", "--is-inside-work-tree"]).await {
        Ok(output) if output.status.success() => {}
        Ok(_) => return DiffOutcome::NotARepository,
        Err(reason) => return DiffOutcome::Failed(reason),
    }

    let pathspec = pattern.map(|p| format!("*{}*", p));
    for staged in [false, true] {
        let mut args = vec!["diff"];
        if staged {
            args.push("--staged");
        }
        if let Some(pathspec) = &pathspec {
            args.push("--");
            args.push(pathspec.as_str());
        }

        let output = match git(workspace, &args).await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                return DiffOutcome::Failed(format!(
                    "git {}: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            }
            Err(reason) => return DiffOutcome::Failed(reason),
        };
        let text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if !text.is_empty() {
            return DiffOutcome::Changes(text);
        }
    }
    DiffOutcome::Clean
}

fn failed(reason: String) -> RollbackOutcome {
    tracing::warn!("rollback failed: {}", reason);
    RollbackOutcome::Failed(reason)
}

/// git runs on a blocking worker so the reactor is never stalled.
async fn git(workspace: &Path, args: &[&str]) -> std::result::Result<Output, String> {
    let dir: PathBuf = workspace.to_path_buf();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let label = args.join(" ");

    let job = tokio::task::spawn_blocking(move || Command::new("git").args(&args).current_dir(&dir).output());

    match tokio::time::timeout(GIT_TIMEOUT, job).await {
        Ok(Ok(Ok(output))) => Ok(output),
        Ok(Ok(Err(e))) => Err(format!("git {}: {}", label, e)),
        Ok(Err(e)) => Err(format!("git {} worker failed: {}", label, e)),
        Err(_) => Err(format!("git {} timed out after {}s", label, GIT_TIMEOUT.as_secs())),
    }
}
