//! Engine configuration (`taskflow.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

/// Engine configuration (TOML).
///
/// Missing fields fall back to the defaults below, so an empty file (or no
/// file at all) is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Implementation attempts before a task is abandoned. A task file may override it.
    pub max_implementation_attempts: u32,

    /// Flat pause, in milliseconds, between a rejected validation and the next fix attempt.
    pub retry_backoff_ms: u64,

    /// Upper bound on agent turns within a single phase.
    pub max_tool_rounds: u32,

    /// Rendered prompts are trimmed to this many bytes.
    pub prompt_budget_bytes: usize,

    /// Directory of `<template>.md` files overriding the built-in prompts.
    pub prompt_dir: Option<PathBuf>,

    pub repository: RepositoryConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Parent directory for per-task clones.
    pub workspace_dir: PathBuf,

    pub clone_timeout_secs: u64,

    /// Truncate captured git output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Change the process working directory into the clone for the duration of a run.
    pub enter_clone: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            workspace_dir: std::env::temp_dir().join("taskflow"),
            clone_timeout_secs: 600,
            output_limit_bytes: 100_000,
            enter_clone: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_implementation_attempts: 3,
            retry_backoff_ms: 5_000,
            max_tool_rounds: 40,
            prompt_budget_bytes: 60_000,
            prompt_dir: None,
            repository: RepositoryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_implementation_attempts == 0 {
            return Err(anyhow!("max_implementation_attempts must be > 0"));
        }
        if self.max_tool_rounds == 0 {
            return Err(anyhow!("max_tool_rounds must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.repository.clone_timeout_secs == 0 {
            return Err(anyhow!("repository.clone_timeout_secs must be > 0"));
        }
        if self.repository.output_limit_bytes == 0 {
            return Err(anyhow!("repository.output_limit_bytes must be > 0"));
        }
        if self.repository.workspace_dir.as_os_str().is_empty() {
            return Err(anyhow!("repository.workspace_dir must not be empty"));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.repository.clone_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.retry_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_is_configured_in_milliseconds() {
        let cfg: EngineConfig = toml::from_str("retry_backoff_ms = 250\n").expect("parse");
        assert_eq!(cfg.retry_backoff(), Duration::from_millis(250));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taskflow.toml");
        fs::write(
            &path,
            "max_implementation_attempts = 5\n[repository]\nclone_timeout_secs = 30\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_implementation_attempts, 5);
        assert_eq!(cfg.max_tool_rounds, 40);
        assert_eq!(cfg.repository.clone_timeout_secs, 30);
        assert!(cfg.repository.enter_clone);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("taskflow.toml");
        fs::write(&path, "max_implementation_attempts = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_implementation_attempts must be > 0"));
    }
}
