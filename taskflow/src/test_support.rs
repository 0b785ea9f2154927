//! Scripted collaborators for tests.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};

use crate::core::types::{
    AgentResponse, ConversationId, Message, ToolCall, ToolChoice, ToolSpec,
};
use crate::io::agent::AgentClient;
use crate::io::repository::{Credentials, FileLister, RepositoryLease, RepositoryLifecycle};
use crate::io::tools::{
    CREATE_BRANCH, CREATE_PULL_REQUEST, PUSH_BRANCH, ToolDefinition, ToolRegistry,
};

/// Pull request URL returned by the fake `create_pull_request` tool.
pub const FAKE_PR_URL: &str = "https://git.example.test/acme/tool/pull/1";

/// A conversation opened through [`ScriptedAgentClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedConversation {
    pub id: ConversationId,
    pub system_prompt: String,
    pub tools: Vec<String>,
}

/// A message sent through [`ScriptedAgentClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub conversation: ConversationId,
    pub message: Message,
    pub tool_choice: ToolChoice,
}

/// Agent client that answers from a queue and records every call.
///
/// Conversation ids are `conv-1`, `conv-2`, ... in creation order. Sending a
/// message with an empty queue panics, which makes unexpected agent turns
/// visible in tests.
#[derive(Debug, Default)]
pub struct ScriptedAgentClient {
    responses: RefCell<VecDeque<Result<AgentResponse, String>>>,
    created: RefCell<Vec<CreatedConversation>>,
    tool_updates: RefCell<Vec<(ConversationId, Vec<String>)>>,
    sent: RefCell<Vec<SentMessage>>,
    next_id: Cell<u32>,
}

impl ScriptedAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: AgentResponse) {
        self.responses.borrow_mut().push_back(Ok(response));
    }

    /// Queue a transport failure for the next `send_message`.
    pub fn push_error(&self, message: &str) {
        self.responses.borrow_mut().push_back(Err(message.to_string()));
    }

    pub fn created(&self) -> Vec<CreatedConversation> {
        self.created.borrow().clone()
    }

    pub fn tool_updates(&self) -> Vec<(ConversationId, Vec<String>)> {
        self.tool_updates.borrow().clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.borrow().clone()
    }

    /// Prompts sent, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|sent| match &sent.message {
                Message::Prompt(text) => Some(text.clone()),
                Message::ToolResults(_) => None,
            })
            .collect()
    }

    pub fn assert_drained(&self) {
        let left = self.responses.borrow().len();
        assert_eq!(left, 0, "{left} scripted response(s) were never consumed");
    }
}

fn tool_names(tools: &[ToolSpec]) -> Vec<String> {
    tools.iter().map(|tool| tool.name.clone()).collect()
}

impl AgentClient for ScriptedAgentClient {
    fn create_conversation(
        &self,
        system_prompt: &str,
        tools: &[ToolSpec],
    ) -> Result<ConversationId> {
        let next = self.next_id.get() + 1;
        self.next_id.set(next);
        let id = ConversationId::new(format!("conv-{next}"));
        self.created.borrow_mut().push(CreatedConversation {
            id: id.clone(),
            system_prompt: system_prompt.to_string(),
            tools: tool_names(tools),
        });
        Ok(id)
    }

    fn update_tools(&self, conversation: &ConversationId, tools: &[ToolSpec]) -> Result<()> {
        self.tool_updates
            .borrow_mut()
            .push((conversation.clone(), tool_names(tools)));
        Ok(())
    }

    fn send_message(
        &self,
        conversation: &ConversationId,
        message: Message,
        tool_choice: &ToolChoice,
    ) -> Result<AgentResponse> {
        self.sent.borrow_mut().push(SentMessage {
            conversation: conversation.clone(),
            message,
            tool_choice: tool_choice.clone(),
        });
        let next = self.responses.borrow_mut().pop_front();
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => panic!("no scripted agent response left"),
        }
    }
}

/// Agent turn that calls one tool.
pub fn tool_reply(name: &str, arguments: Value) -> AgentResponse {
    AgentResponse {
        text: None,
        tool_calls: vec![ToolCall {
            id: format!("{name}-call"),
            name: name.to_string(),
            arguments,
        }],
    }
}

/// Agent turn with text and no tool calls.
pub fn text_reply(text: &str) -> AgentResponse {
    AgentResponse {
        text: Some(text.to_string()),
        tool_calls: Vec::new(),
    }
}

/// Built-in tools with the git and hosting tools replaced by fakes.
///
/// `create_branch` echoes the requested name, `push_branch` does nothing,
/// `create_pull_request` returns [`FAKE_PR_URL`], and `echo` returns its
/// `text` argument (a non-final tool for exercising the tool loop).
pub fn fake_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::with_builtin_tools().expect("builtin tools");
    let fakes = [
        ToolDefinition::new(
            CREATE_BRANCH,
            "Create the working branch.",
            json!({
                "type": "object",
                "properties": {"branch_name": {"type": "string"}},
                "required": ["branch_name"]
            }),
            |args, _| {
                Ok(json!({"success": true, "data": {"branch_name": args["branch_name"]}})
                    .to_string())
            },
        )
        .final_tool(),
        ToolDefinition::new(
            PUSH_BRANCH,
            "Push the working branch.",
            json!({"type": "object"}),
            |_, _| Ok("pushed".to_string()),
        ),
        ToolDefinition::new(
            CREATE_PULL_REQUEST,
            "Open a pull request.",
            json!({
                "type": "object",
                "properties": {"title": {"type": "string"}},
                "required": ["title"]
            }),
            |_, _| Ok(json!({"success": true, "data": {"url": FAKE_PR_URL}}).to_string()),
        )
        .final_tool(),
        ToolDefinition::new(
            "echo",
            "Return the given text.",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            |args, _| Ok(args["text"].as_str().unwrap_or_default().to_string()),
        ),
    ];
    for tool in fakes {
        registry.register(tool).expect("fake tool");
    }
    registry
}

/// Repository lifecycle and file lister that touch nothing on disk.
#[derive(Debug)]
pub struct RecordingRepository {
    clone_path: PathBuf,
    default_branch: String,
    files: RefCell<Vec<String>>,
    fail_setup: bool,
    fail_listing: Cell<bool>,
    setups: Cell<u32>,
    cleanups: Cell<u32>,
    listings: Cell<u32>,
    credentials: RefCell<Option<Credentials>>,
}

impl Default for RecordingRepository {
    fn default() -> Self {
        Self {
            clone_path: PathBuf::from("/work/tool_20260101_000000_abcdef"),
            default_branch: "main".to_string(),
            files: RefCell::new(vec!["Cargo.toml".to_string(), "src/main.rs".to_string()]),
            fail_setup: false,
            fail_listing: Cell::new(false),
            setups: Cell::new(0),
            cleanups: Cell::new(0),
            listings: Cell::new(0),
            credentials: RefCell::new(None),
        }
    }
}

impl RecordingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository whose setup always fails.
    pub fn failing_setup() -> Self {
        Self {
            fail_setup: true,
            ..Self::default()
        }
    }

    pub fn clone_path(&self) -> &Path {
        &self.clone_path
    }

    pub fn set_files(&self, files: &[&str]) {
        *self.files.borrow_mut() = files.iter().map(|file| file.to_string()).collect();
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.set(fail);
    }

    pub fn setups(&self) -> u32 {
        self.setups.get()
    }

    pub fn cleanups(&self) -> u32 {
        self.cleanups.get()
    }

    pub fn listings(&self) -> u32 {
        self.listings.get()
    }

    /// Credentials passed to the last setup.
    pub fn last_credentials(&self) -> Option<Credentials> {
        self.credentials.borrow().clone()
    }
}

impl RepositoryLifecycle for RecordingRepository {
    fn setup_repository(&self, _url: &str, credentials: &Credentials) -> Result<RepositoryLease> {
        self.setups.set(self.setups.get() + 1);
        *self.credentials.borrow_mut() = Some(credentials.clone());
        if self.fail_setup {
            bail!("clone refused by remote");
        }
        Ok(RepositoryLease {
            clone_path: self.clone_path.clone(),
            original_dir: PathBuf::from("/home/dev"),
            default_branch: self.default_branch.clone(),
        })
    }

    fn cleanup_repository(&self, _lease: &RepositoryLease) -> Result<()> {
        self.cleanups.set(self.cleanups.get() + 1);
        Ok(())
    }
}

impl FileLister for RecordingRepository {
    fn current_files(&self, root: &Path) -> Result<Vec<String>> {
        self.listings.set(self.listings.get() + 1);
        if root != self.clone_path {
            bail!("listed unexpected root {}", root.display());
        }
        if self.fail_listing.get() {
            bail!("working copy vanished");
        }
        Ok(self.files.borrow().clone())
    }
}
