//! Task files: what to change, where, and how to tell that it is done.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::context::{Context, keys};
use crate::io::config::EngineConfig;
use crate::io::repository::Credentials;

/// One task, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub repository_url: String,

    /// Branch to start from; the clone's default branch when absent.
    #[serde(default)]
    pub base_branch: Option<String>,

    pub description: String,

    pub acceptance_criteria: Vec<String>,

    /// Overrides the engine-wide attempt limit for this task.
    #[serde(default)]
    pub max_implementation_attempts: Option<u32>,

    #[serde(default)]
    pub author: Author,

    #[serde(default)]
    pub credentials: CredentialSource,

    /// Extra context seeds, available to templates and tools by key.
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Default for Author {
    fn default() -> Self {
        Self {
            name: "taskflow".to_string(),
            email: "taskflow@localhost".to_string(),
        }
    }
}

/// Where clone credentials come from. The token itself never lives in the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialSource {
    pub username: Option<String>,
    /// Environment variable holding the access token.
    pub token_env: Option<String>,
}

impl TaskSpec {
    pub fn validate(&self) -> Result<()> {
        if self.repository_url.trim().is_empty() {
            return Err(anyhow!("repository_url must not be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(anyhow!("description must not be empty"));
        }
        if self.acceptance_criteria.is_empty() {
            return Err(anyhow!("acceptance_criteria must list at least one criterion"));
        }
        if self
            .acceptance_criteria
            .iter()
            .any(|item| item.trim().is_empty())
        {
            return Err(anyhow!("acceptance_criteria entries must not be blank"));
        }
        if self.max_implementation_attempts == Some(0) {
            return Err(anyhow!("max_implementation_attempts must be > 0"));
        }
        if self
            .base_branch
            .as_deref()
            .is_some_and(|branch| branch.trim().is_empty())
        {
            return Err(anyhow!("base_branch must not be blank when set"));
        }
        Ok(())
    }

    /// Attempt limit for this task: the task override, else the engine default.
    pub fn attempt_limit(&self, config: &EngineConfig) -> u32 {
        self.max_implementation_attempts
            .unwrap_or(config.max_implementation_attempts)
    }

    /// Initial context for a run.
    ///
    /// Free-form `[context]` entries go in first; the task's own fields
    /// overwrite any entry with a well-known key.
    pub fn seed_context(&self) -> Context {
        let mut ctx = Context::from_seeds(self.context.clone());
        ctx.insert(keys::REPOSITORY_URL, self.repository_url.clone());
        ctx.insert(keys::TASK_DESCRIPTION, self.description.trim().to_string());
        ctx.insert(
            keys::ACCEPTANCE_CRITERIA,
            Value::from(self.acceptance_criteria.clone()),
        );
        ctx.insert(keys::AUTHOR_NAME, self.author.name.clone());
        ctx.insert(keys::AUTHOR_EMAIL, self.author.email.clone());
        if let Some(base) = &self.base_branch {
            ctx.insert(keys::BASE_BRANCH, base.clone());
        }
        ctx
    }

    /// Resolve credentials, reading the token from the named environment variable.
    pub fn resolve_credentials(&self) -> Result<Credentials> {
        let token = match &self.credentials.token_env {
            Some(var) => Some(
                env::var(var)
                    .with_context(|| format!("read token from environment variable {var}"))?,
            ),
            None => None,
        };
        Ok(Credentials {
            username: self.credentials.username.clone(),
            token,
        })
    }
}

/// Load and validate a task file.
pub fn load_task(path: &Path) -> Result<TaskSpec> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let task: TaskSpec =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    task.validate()
        .with_context(|| format!("invalid task {}", path.display()))?;
    Ok(task)
}
