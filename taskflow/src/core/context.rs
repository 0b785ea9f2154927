//! Per-run key/value store shared by every phase of one workflow.
//!
//! Values are plain JSON so that prompt templates, contract checks and tool
//! handlers all observe the same shapes. A later write to an existing key
//! overwrites it.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Well-known context keys written by the task state machine.
pub mod keys {
    pub const REPOSITORY_URL: &str = "repository_url";
    pub const BASE_BRANCH: &str = "base_branch";
    pub const HEAD_BRANCH: &str = "head_branch";
    pub const CLONE_PATH: &str = "clone_path";
    pub const ORIGINAL_DIR: &str = "original_dir";
    pub const CURRENT_FILES: &str = "current_files";
    pub const TASK_DESCRIPTION: &str = "task_description";
    pub const ACCEPTANCE_CRITERIA: &str = "acceptance_criteria";
    pub const PREVIOUS_ISSUES: &str = "previous_issues";
    pub const AUTHOR_NAME: &str = "author_name";
    pub const AUTHOR_EMAIL: &str = "author_email";
}

/// Mutable context owned by exactly one workflow instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from constructor seeds.
    pub fn from_seeds<K, I>(seeds: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self {
            values: seeds.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Insert or overwrite `key`, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// String value for `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// List-of-strings value for `key`; non-string elements are skipped.
    pub fn get_str_list(&self, key: &str) -> Option<Vec<&str>> {
        let items = self.values.get(key)?.as_array()?;
        Some(items.iter().filter_map(Value::as_str).collect())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
