//! Git adapter for repository setup and the built-in git tools.
//!
//! We keep a small, explicit wrapper around `git` subprocess calls. Clone
//! URLs may embed credentials, so anything echoed back from git is passed
//! through [`redact_credentials`] before it reaches logs or errors.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::io::process::run_with_deadline;

static URL_USERINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(https?://)[^/@\s]+@").expect("static regex"));

/// Replace `user:token@` in any URL inside `text` with `***@`.
pub fn redact_credentials(text: &str) -> String {
    URL_USERINFO.replace_all(text, "${1}***@").into_owned()
}

/// Commit author identity passed to `git commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `url` into `dest` (which must not exist yet).
    #[instrument(skip_all, fields(dest = %dest.display()))]
    pub fn clone(url: &str, dest: &Path, timeout: Duration, output_limit: usize) -> Result<Self> {
        debug!(url = %redact_credentials(url), "cloning repository");
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--quiet").arg(url).arg(dest);
        let output = run_with_deadline(cmd, timeout, output_limit).context("spawn git clone")?;
        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "git clone timed out");
            return Err(anyhow!("git clone timed out after {timeout:?}"));
        }
        if !output.succeeded() {
            return Err(anyhow!(
                "git clone failed: {}",
                redact_credentials(&output.stderr)
            ));
        }
        Ok(Self::new(dest))
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (cannot determine base branch)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Tracked and untracked (but not ignored) files, relative and sorted.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files", "--cached", "--others", "--exclude-standard", "-z"])?;
        let mut files: Vec<String> = out
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message as `author`.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str, author: &Identity) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        let name = format!("user.name={}", author.name);
        let email = format!("user.email={}", author.email);
        self.run_checked(&["-c", &name, "-c", &email, "commit", "-m", message])?;
        Ok(true)
    }

    /// Push `branch` to `origin`, setting upstream.
    #[instrument(skip_all, fields(branch))]
    pub fn push_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "pushing branch");
        self.run_checked(&["push", "--set-upstream", "origin", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                redact_credentials(stderr.trim())
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
