//! Repository lifecycle: clone a working copy for a task and release it.
//!
//! The task state machine only sees the [`RepositoryLifecycle`] and
//! [`FileLister`] traits. [`GitRepository`] is the default implementation:
//! it clones into a uniquely named directory under the configured workspace,
//! optionally enters it, and removes it again on cleanup.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::io::config::RepositoryConfig;
use crate::io::git::{Git, redact_credentials};

const DEFAULT_TOKEN_USERNAME: &str = "x-access-token";

/// Credentials used to clone (and later push to) the remote.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    /// Embed the token into an `https://` URL.
    ///
    /// URLs that already carry userinfo, non-HTTPS URLs, and credentials
    /// without a token are returned unchanged.
    pub fn authenticated_url(&self, url: &str) -> String {
        let Some(token) = self.token.as_deref() else {
            return url.to_string();
        };
        let Some(rest) = url.strip_prefix("https://") else {
            return url.to_string();
        };
        let host = rest.split('/').next().unwrap_or_default();
        if host.contains('@') {
            return url.to_string();
        }
        let username = self.username.as_deref().unwrap_or(DEFAULT_TOKEN_USERNAME);
        format!("https://{username}:{token}@{rest}")
    }
}

/// Handle on a cloned working copy, released by [`RepositoryLifecycle::cleanup_repository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryLease {
    pub clone_path: PathBuf,
    /// Working directory of the process before setup.
    pub original_dir: PathBuf,
    /// Branch checked out right after the clone.
    pub default_branch: String,
}

/// Acquires and releases the working copy for one task.
pub trait RepositoryLifecycle {
    fn setup_repository(&self, url: &str, credentials: &Credentials) -> Result<RepositoryLease>;

    fn cleanup_repository(&self, lease: &RepositoryLease) -> Result<()>;
}

/// Lists files of a working copy, relative to its root.
pub trait FileLister {
    fn current_files(&self, root: &Path) -> Result<Vec<String>>;
}

/// Git-backed repository lifecycle and file listing.
#[derive(Debug, Clone)]
pub struct GitRepository {
    config: RepositoryConfig,
}

impl GitRepository {
    pub fn new(config: RepositoryConfig) -> Self {
        Self { config }
    }

    /// Post-clone steps: detect the default branch, then enter the clone if configured.
    fn prepare_clone(&self, git: &Git) -> Result<String> {
        let default_branch = git.current_branch().context("detect default branch")?;
        if self.config.enter_clone {
            env::set_current_dir(git.workdir())
                .with_context(|| format!("enter clone {}", git.workdir().display()))?;
        }
        Ok(default_branch)
    }
}

impl RepositoryLifecycle for GitRepository {
    #[instrument(skip_all, fields(workspace = %self.config.workspace_dir.display()))]
    fn setup_repository(&self, url: &str, credentials: &Credentials) -> Result<RepositoryLease> {
        let workspace = &self.config.workspace_dir;
        fs::create_dir_all(workspace)
            .with_context(|| format!("create workspace dir {}", workspace.display()))?;
        let original_dir = env::current_dir().context("read current directory")?;

        let name = build_clone_name(&repository_name(url), &generate_timestamp(), &generate_short_id());
        let clone_path = workspace.join(name);
        let clone_url = credentials.authenticated_url(url);
        let git = match Git::clone(
            &clone_url,
            &clone_path,
            std::time::Duration::from_secs(self.config.clone_timeout_secs),
            self.config.output_limit_bytes,
        ) {
            Ok(git) => git,
            Err(err) => {
                remove_partial_clone(&clone_path);
                return Err(err).with_context(|| format!("clone {}", redact_credentials(url)));
            }
        };
        let default_branch = match self.prepare_clone(&git) {
            Ok(branch) => branch,
            Err(err) => {
                remove_partial_clone(&clone_path);
                return Err(err);
            }
        };
        info!(path = %clone_path.display(), branch = %default_branch, "repository ready");
        Ok(RepositoryLease {
            clone_path,
            original_dir,
            default_branch,
        })
    }

    #[instrument(skip_all, fields(path = %lease.clone_path.display()))]
    fn cleanup_repository(&self, lease: &RepositoryLease) -> Result<()> {
        if self.config.enter_clone {
            env::set_current_dir(&lease.original_dir).with_context(|| {
                format!("restore working directory {}", lease.original_dir.display())
            })?;
        }
        if lease.clone_path.exists() {
            fs::remove_dir_all(&lease.clone_path)
                .with_context(|| format!("remove clone {}", lease.clone_path.display()))?;
        }
        debug!("repository released");
        Ok(())
    }
}

impl FileLister for GitRepository {
    fn current_files(&self, root: &Path) -> Result<Vec<String>> {
        Git::new(root).list_files()
    }
}

fn remove_partial_clone(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(err) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), err = %err, "failed to remove partial clone");
    }
}

/// Last path segment of a clone URL without `.git`, reduced to `[A-Za-z0-9_-]`.
pub fn repository_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    let name: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if name.is_empty() {
        "repository".to_string()
    } else {
        name
    }
}

pub fn build_clone_name(repo: &str, timestamp: &str, short_id: &str) -> String {
    format!("{repo}_{timestamp}_{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
