//! Tool definitions and dispatch.
//!
//! The [`ToolExecutor`] trait is the tool-execution collaborator a phase
//! hands every agent response to. [`ToolRegistry`] is the default
//! implementation: it checks call arguments against each tool's JSON Schema,
//! runs the handler, and reports a [`ToolOutcome`]. A tool flagged as final
//! ends the phase with its result, whatever the agent would do next.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context as _, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::context::{Context, keys};
use crate::core::types::{AgentResponse, ToolCall, ToolCallResult, ToolOutcome, ToolSpec};
use crate::io::git::{Git, Identity};

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const LIST_FILES: &str = "list_files";
pub const CREATE_BRANCH: &str = "create_branch";
pub const COMMIT_CHANGES: &str = "commit_changes";
pub const PUSH_BRANCH: &str = "push_branch";
pub const SUBMIT_IMPLEMENTATION: &str = "submit_implementation";
pub const SUBMIT_VALIDATION: &str = "submit_validation";
/// Registered by the caller: opening a pull request is a hosting-platform concern.
pub const CREATE_PULL_REQUEST: &str = "create_pull_request";

/// Executes the tool calls in an agent response.
pub trait ToolExecutor {
    /// Advertised description of `name`, or `None` if the tool is unknown.
    fn describe(&self, name: &str) -> Option<ToolSpec>;

    /// Run every tool call in `response` and classify the outcome.
    ///
    /// Calls to tools outside `allowed` are answered with an error result
    /// and never run.
    fn handle_tool_response(
        &self,
        response: &AgentResponse,
        allowed: &[&str],
        context: &Context,
    ) -> Result<ToolOutcome>;
}

type Handler = Box<dyn Fn(&Value, &Context) -> Result<String>>;

/// A named, schema-described capability the agent may invoke.
pub struct ToolDefinition {
    pub spec: ToolSpec,
    /// When set, a successful call ends the phase with this tool's result.
    pub final_tool: bool,
    handler: Handler,
}

impl ToolDefinition {
    pub fn new(
        name: &str,
        description: &str,
        parameters: Value,
        handler: impl Fn(&Value, &Context) -> Result<String> + 'static,
    ) -> Self {
        Self {
            spec: ToolSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
            final_tool: false,
            handler: Box::new(handler),
        }
    }

    pub fn final_tool(mut self) -> Self {
        self.final_tool = true;
        self
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("spec", &self.spec)
            .field("final_tool", &self.final_tool)
            .field("handler", &"<fn>")
            .finish()
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    validator: Validator,
}

/// Tool registry with schema-checked dispatch.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the file, git and submission tools.
    ///
    /// `create_pull_request` is not included; register it separately.
    pub fn with_builtin_tools() -> Result<Self> {
        let mut registry = Self::new();
        for tool in builtin_tools() {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Register (or replace) a tool. Fails if its parameter schema does not compile.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<()> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&definition.spec.parameters)
            .map_err(|err| anyhow!("compile parameter schema for '{}': {err}", definition.spec.name))?;
        self.tools.insert(
            definition.spec.name.clone(),
            RegisteredTool {
                definition,
                validator,
            },
        );
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    fn dispatch(&self, call: &ToolCall, allowed: &[&str], context: &Context) -> (String, bool) {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "agent called unknown tool");
            return (format!("error: unknown tool '{}'", call.name), false);
        };
        if !allowed.contains(&call.name.as_str()) {
            warn!(tool = %call.name, "agent called a tool outside the phase allow-list");
            return (
                format!("error: tool '{}' is not available in this phase", call.name),
                false,
            );
        }
        let errors: Vec<String> = tool
            .validator
            .iter_errors(&call.arguments)
            .map(|err| err.to_string())
            .collect();
        if !errors.is_empty() {
            debug!(tool = %call.name, count = errors.len(), "tool arguments rejected");
            return (
                format!("error: invalid arguments:\n- {}", errors.join("\n- ")),
                false,
            );
        }
        match (tool.definition.handler)(&call.arguments, context) {
            Ok(response) => (response, tool.definition.final_tool),
            Err(err) => {
                warn!(tool = %call.name, err = %format!("{err:#}"), "tool handler failed");
                (format!("error: {err:#}"), false)
            }
        }
    }
}

impl ToolExecutor for ToolRegistry {
    fn describe(&self, name: &str) -> Option<ToolSpec> {
        self.tools.get(name).map(|tool| tool.definition.spec.clone())
    }

    #[instrument(skip_all, fields(calls = response.tool_calls.len()))]
    fn handle_tool_response(
        &self,
        response: &AgentResponse,
        allowed: &[&str],
        context: &Context,
    ) -> Result<ToolOutcome> {
        if response.tool_calls.is_empty() {
            return Ok(ToolOutcome::Stopped);
        }
        let mut results = Vec::with_capacity(response.tool_calls.len());
        for (idx, call) in response.tool_calls.iter().enumerate() {
            let (text, terminal) = self.dispatch(call, allowed, context);
            let result = ToolCallResult {
                tool_call_id: call.id.clone(),
                response: text,
            };
            if terminal {
                let skipped = response.tool_calls.len() - idx - 1;
                if skipped > 0 {
                    warn!(tool = %call.name, skipped, "final tool ended phase before later calls");
                }
                info!(tool = %call.name, "final tool completed");
                return Ok(ToolOutcome::Terminal(result));
            }
            results.push(result);
        }
        Ok(ToolOutcome::Continue(results))
    }
}

/// Wrap arguments of a submission tool into a successful phase envelope.
fn submission_envelope(args: &Value) -> Result<String> {
    serde_json::to_string(&json!({"success": true, "data": args})).context("serialize submission")
}

/// Tools the phases need that the engine can implement itself.
pub fn builtin_tools() -> Vec<ToolDefinition> {
    let mut tools = vec![
        ToolDefinition::new(
            READ_FILE,
            "Read a UTF-8 file from the repository.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "minLength": 1}},
                "required": ["path"],
                "additionalProperties": false
            }),
            |args, ctx| {
                let path = resolve_in_clone(ctx, str_arg(args, "path")?)?;
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
            },
        ),
        ToolDefinition::new(
            WRITE_FILE,
            "Create or overwrite a file in the repository.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "minLength": 1},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
            |args, ctx| {
                let rel = str_arg(args, "path")?;
                let path = resolve_in_clone(ctx, rel)?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                let content = str_arg(args, "content")?;
                fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
                Ok(format!("wrote {} bytes to {rel}", content.len()))
            },
        ),
        ToolDefinition::new(
            LIST_FILES,
            "List repository files (tracked and untracked, not ignored).",
            json!({"type": "object", "properties": {}, "additionalProperties": false}),
            |_, ctx| {
                let files = Git::new(clone_path(ctx)?).list_files()?;
                Ok(files.join("\n"))
            },
        ),
        ToolDefinition::new(
            CREATE_BRANCH,
            "Create and check out the working branch for this task.",
            json!({
                "type": "object",
                "properties": {"branch_name": {"type": "string", "pattern": "^[A-Za-z0-9._/-]+$"}},
                "required": ["branch_name"],
                "additionalProperties": false
            }),
            |args, ctx| {
                let branch = str_arg(args, "branch_name")?;
                let git = Git::new(clone_path(ctx)?);
                if git.branch_exists(branch)? {
                    bail!("branch '{branch}' already exists");
                }
                git.checkout_new_branch(branch)?;
                submission_envelope(&json!({"branch_name": branch}))
            },
        ),
        ToolDefinition::new(
            COMMIT_CHANGES,
            "Stage and commit all changes in the repository.",
            json!({
                "type": "object",
                "properties": {"message": {"type": "string", "minLength": 1}},
                "required": ["message"],
                "additionalProperties": false
            }),
            |args, ctx| {
                let git = Git::new(clone_path(ctx)?);
                let author = Identity {
                    name: ctx_str(ctx, keys::AUTHOR_NAME)?.to_string(),
                    email: ctx_str(ctx, keys::AUTHOR_EMAIL)?.to_string(),
                };
                git.add_all()?;
                if git.commit_staged(str_arg(args, "message")?, &author)? {
                    Ok("committed".to_string())
                } else {
                    Ok("nothing to commit".to_string())
                }
            },
        ),
        ToolDefinition::new(
            PUSH_BRANCH,
            "Push the working branch to the remote.",
            json!({"type": "object", "properties": {}, "additionalProperties": false}),
            |_, ctx| {
                let branch = ctx_str(ctx, keys::HEAD_BRANCH)?;
                Git::new(clone_path(ctx)?).push_branch(branch)?;
                Ok(format!("pushed {branch}"))
            },
        ),
        ToolDefinition::new(
            SUBMIT_IMPLEMENTATION,
            "Declare the implementation finished.",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string"},
                    "files_changed": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["summary"]
            }),
            |args, _| submission_envelope(args),
        ),
        ToolDefinition::new(
            SUBMIT_VALIDATION,
            "Report whether the change meets every acceptance criterion.",
            json!({
                "type": "object",
                "properties": {
                    "validated": {"type": "boolean"},
                    "not_met": {"type": "array", "items": {"type": "string"}},
                    "notes": {"type": "string"}
                },
                "required": ["validated"]
            }),
            |args, _| submission_envelope(args),
        ),
    ];
    for tool in &mut tools {
        if matches!(
            tool.spec.name.as_str(),
            CREATE_BRANCH | SUBMIT_IMPLEMENTATION | SUBMIT_VALIDATION
        ) {
            tool.final_tool = true;
        }
    }
    tools
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string argument '{name}'"))
}

fn ctx_str<'a>(ctx: &'a Context, key: &str) -> Result<&'a str> {
    ctx.get_str(key)
        .ok_or_else(|| anyhow!("context key '{key}' is not set"))
}

fn clone_path(ctx: &Context) -> Result<PathBuf> {
    ctx_str(ctx, keys::CLONE_PATH).map(PathBuf::from)
}

/// Resolve a repository-relative path, refusing anything that escapes the clone.
fn resolve_in_clone(ctx: &Context, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    let escapes = rel_path.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        bail!("path '{rel}' must be relative to the repository root");
    }
    Ok(clone_path(ctx)?.join(rel_path))
}
