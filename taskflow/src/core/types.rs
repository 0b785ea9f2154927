//! Shared types for the phase engine.
//!
//! These define the contracts between phases, the task state machine and the
//! external collaborators (agent client, tool executor). They carry no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The phases the task state machine sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    BranchCreation,
    Implementation,
    FixImplementation,
    Validation,
    PullRequest,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 5] = [
        PhaseKind::BranchCreation,
        PhaseKind::Implementation,
        PhaseKind::FixImplementation,
        PhaseKind::Validation,
        PhaseKind::PullRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::BranchCreation => "branch_creation",
            PhaseKind::Implementation => "implementation",
            PhaseKind::FixImplementation => "fix_implementation",
            PhaseKind::Validation => "validation",
            PhaseKind::PullRequest => "pull_request",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform outcome of one phase execution.
///
/// `error` is set only when `success` is false. Use [`PhaseResult::ok`] and
/// [`PhaseResult::failed`] to keep that invariant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseResult {
    pub success: bool,
    pub data: Map<String, Value>,
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn ok(data: Map<String, Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Map::new(),
            error: Some(error.into()),
        }
    }

    /// String field from `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

/// Opaque identifier of a conversation held by the agent client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether the agent's next action must be a specific tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "tool")]
pub enum ToolChoice {
    Optional,
    Required(String),
}

impl fmt::Display for ToolChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolChoice::Optional => f.write_str("optional"),
            ToolChoice::Required(tool) => write!(f, "required:{tool}"),
        }
    }
}

/// Tool description advertised to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the call arguments.
    pub parameters: Value,
}

/// A tool invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Result of one tool call, sent back to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_call_id: String,
    pub response: String,
}

/// One agent turn: optional text plus zero or more tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// A message sent to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "body")]
pub enum Message {
    Prompt(String),
    ToolResults(Vec<ToolCallResult>),
}

/// What the tool executor made of one agent response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// Tools ran; send these results back and keep going.
    Continue(Vec<ToolCallResult>),
    /// A final tool ran; its result ends the phase.
    Terminal(ToolCallResult),
    /// The agent answered without requesting any tool.
    Stopped,
}
