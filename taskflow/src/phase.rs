//! A single phase: one prompt, one tool allow-list, one parsed result.
//!
//! Construction does every check that needs no collaborator call (context
//! contract, tool resolution, template rendering), so a misconfigured phase
//! fails before the agent is ever contacted. Execution never fails: every
//! error becomes a failed [`PhaseResult`].

use anyhow::{Context as _, Result, anyhow};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::context::{Context, keys};
use crate::core::contract::{ContextRequirement, ContractError, Shape, validate_context};
use crate::core::result_parser::parse_phase_result;
use crate::core::types::{
    ConversationId, Message, PhaseKind, PhaseResult, ToolCallResult, ToolChoice, ToolOutcome,
    ToolSpec,
};
use crate::io::agent::AgentClient;
use crate::io::prompt::{PromptError, PromptLibrary, SYSTEM_TEMPLATE};
use crate::io::tools::{
    COMMIT_CHANGES, CREATE_BRANCH, CREATE_PULL_REQUEST, LIST_FILES, PUSH_BRANCH, READ_FILE,
    SUBMIT_IMPLEMENTATION, SUBMIT_VALIDATION, ToolExecutor, WRITE_FILE,
};

/// Static description of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDefinition {
    pub kind: PhaseKind,
    /// Prompt template name in the [`PromptLibrary`].
    pub template: &'static str,
    /// Tools the agent may call during this phase.
    pub tools: Vec<&'static str>,
    /// Tool the agent must call on its first turn.
    pub required_tool: Option<&'static str>,
    pub requirement: ContextRequirement,
}

impl PhaseDefinition {
    /// Built-in definition for `kind`.
    pub fn builtin(kind: PhaseKind) -> Self {
        let files = Shape::list(Shape::String);
        match kind {
            PhaseKind::BranchCreation => Self {
                kind,
                template: kind.as_str(),
                tools: vec![LIST_FILES, CREATE_BRANCH],
                required_tool: Some(CREATE_BRANCH),
                requirement: ContextRequirement::new()
                    .prompt(keys::TASK_DESCRIPTION, Shape::String)
                    .prompt(keys::BASE_BRANCH, Shape::String)
                    .prompt(keys::CURRENT_FILES, files)
                    .tool(keys::CLONE_PATH, Shape::String),
            },
            PhaseKind::Implementation | PhaseKind::FixImplementation => {
                let mut requirement = ContextRequirement::new()
                    .prompt(keys::TASK_DESCRIPTION, Shape::String)
                    .prompt(keys::ACCEPTANCE_CRITERIA, Shape::list(Shape::String))
                    .prompt(keys::CURRENT_FILES, files)
                    .prompt(keys::HEAD_BRANCH, Shape::String);
                if kind == PhaseKind::FixImplementation {
                    requirement = requirement.prompt(keys::PREVIOUS_ISSUES, Shape::String);
                }
                Self {
                    kind,
                    template: kind.as_str(),
                    tools: vec![
                        READ_FILE,
                        WRITE_FILE,
                        LIST_FILES,
                        COMMIT_CHANGES,
                        SUBMIT_IMPLEMENTATION,
                    ],
                    required_tool: None,
                    requirement: requirement
                        .tool(keys::CLONE_PATH, Shape::String)
                        .tool(keys::AUTHOR_NAME, Shape::String)
                        .tool(keys::AUTHOR_EMAIL, Shape::String),
                }
            }
            PhaseKind::Validation => Self {
                kind,
                template: kind.as_str(),
                tools: vec![READ_FILE, LIST_FILES, SUBMIT_VALIDATION],
                required_tool: None,
                requirement: ContextRequirement::new()
                    .prompt(keys::TASK_DESCRIPTION, Shape::String)
                    .prompt(keys::ACCEPTANCE_CRITERIA, Shape::list(Shape::String))
                    .tool(keys::CLONE_PATH, Shape::String),
            },
            PhaseKind::PullRequest => Self {
                kind,
                template: kind.as_str(),
                tools: vec![PUSH_BRANCH, CREATE_PULL_REQUEST],
                required_tool: Some(CREATE_PULL_REQUEST),
                requirement: ContextRequirement::new()
                    .prompt(keys::TASK_DESCRIPTION, Shape::String)
                    .prompt(keys::HEAD_BRANCH, Shape::String)
                    .prompt(keys::BASE_BRANCH, Shape::String)
                    .prompt(keys::CURRENT_FILES, files)
                    .tool(keys::CLONE_PATH, Shape::String)
                    .tool(keys::REPOSITORY_URL, Shape::String),
            },
        }
    }

    /// Check `context` against this phase's contract.
    pub fn check_context(&self, context: &Context) -> Result<(), ContractError> {
        validate_context(context, &self.requirement).map_err(|violations| ContractError {
            phase: self.kind.to_string(),
            violations,
            requirement: self.requirement.clone(),
        })
    }

    /// Render this phase's prompt template against `context`.
    pub fn render_prompt(
        &self,
        context: &Context,
        prompts: &PromptLibrary,
    ) -> Result<String, PhaseConstructionError> {
        render_template(self.kind, self.template, context, prompts)
    }
}

fn render_template(
    kind: PhaseKind,
    template: &str,
    context: &Context,
    prompts: &PromptLibrary,
) -> Result<String, PhaseConstructionError> {
    prompts
        .render(template, context)
        .map_err(|source| PhaseConstructionError::Prompt {
            phase: kind,
            source,
        })
}

/// What a phase borrows from its owning workflow while it is constructed.
#[derive(Clone, Copy)]
pub struct PhaseEnv<'a> {
    pub context: &'a Context,
    pub prompts: &'a PromptLibrary,
    pub tools: &'a dyn ToolExecutor,
    pub max_tool_rounds: u32,
}

#[derive(Debug, Error)]
pub enum PhaseConstructionError {
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("phase '{phase}': {source}")]
    Prompt {
        phase: PhaseKind,
        #[source]
        source: PromptError,
    },
    #[error("phase '{phase}' allows unknown tool '{tool}'")]
    UnknownTool { phase: PhaseKind, tool: String },
    #[error("phase '{phase}' requires tool '{tool}' which is not in its allow-list")]
    RequiredToolNotAllowed { phase: PhaseKind, tool: String },
}

/// Result of executing a phase, plus the conversation it ran in.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutput {
    /// `None` only when no conversation could be created.
    pub conversation: Option<ConversationId>,
    pub result: PhaseResult,
}

/// A constructed, ready-to-run phase.
#[derive(Debug, Clone)]
pub struct Phase {
    kind: PhaseKind,
    system_prompt: String,
    prompt: String,
    tools: Vec<ToolSpec>,
    tool_choice: ToolChoice,
    conversation: Option<ConversationId>,
    max_tool_rounds: u32,
}

impl Phase {
    /// Validate the context contract, resolve tools, and render prompts.
    ///
    /// `conversation` continues an existing conversation; `None` starts a new one.
    pub fn new(
        definition: &PhaseDefinition,
        env: &PhaseEnv<'_>,
        conversation: Option<ConversationId>,
    ) -> Result<Self, PhaseConstructionError> {
        let kind = definition.kind;
        definition.check_context(env.context)?;

        let tools = definition
            .tools
            .iter()
            .map(|name| {
                env.tools
                    .describe(name)
                    .ok_or_else(|| PhaseConstructionError::UnknownTool {
                        phase: kind,
                        tool: (*name).to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let tool_choice = match definition.required_tool {
            Some(tool) if !definition.tools.contains(&tool) => {
                return Err(PhaseConstructionError::RequiredToolNotAllowed {
                    phase: kind,
                    tool: tool.to_string(),
                });
            }
            Some(tool) => ToolChoice::Required(tool.to_string()),
            None => ToolChoice::Optional,
        };

        let prompt = definition.render_prompt(env.context, env.prompts)?;
        let system_prompt = render_template(kind, SYSTEM_TEMPLATE, env.context, env.prompts)?;
        debug!(phase = %kind, prompt_bytes = prompt.len(), tools = tools.len(), "phase constructed");

        Ok(Self {
            kind,
            system_prompt,
            prompt,
            tools,
            tool_choice,
            conversation,
            max_tool_rounds: env.max_tool_rounds,
        })
    }

    pub fn kind(&self) -> PhaseKind {
        self.kind
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn tools(&self) -> &[ToolSpec] {
        &self.tools
    }

    pub fn tool_choice(&self) -> &ToolChoice {
        &self.tool_choice
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    /// Run the phase to completion. Never fails; see [`PhaseResult::failed`].
    #[instrument(skip_all, fields(phase = %self.kind))]
    pub fn execute(
        &self,
        client: &dyn AgentClient,
        tools: &dyn ToolExecutor,
        context: &Context,
    ) -> PhaseOutput {
        let mut conversation = self.conversation.clone();
        let result = match self.converse(client, tools, context, &mut conversation) {
            Ok(raw) => parse_phase_result(&raw),
            Err(err) => PhaseResult::failed(format!("{err:#}")),
        };
        if result.success {
            info!("phase succeeded");
        } else {
            warn!(error = result.error_message(), "phase failed");
        }
        PhaseOutput {
            conversation,
            result,
        }
    }

    /// Drive the tool loop and return the raw terminal tool result.
    fn converse(
        &self,
        client: &dyn AgentClient,
        tools: &dyn ToolExecutor,
        context: &Context,
        conversation: &mut Option<ConversationId>,
    ) -> Result<String> {
        let id = match conversation.clone() {
            Some(id) => {
                client
                    .update_tools(&id, &self.tools)
                    .context("update conversation tools")?;
                id
            }
            None => {
                let id = client
                    .create_conversation(&self.system_prompt, &self.tools)
                    .context("create conversation")?;
                debug!(conversation = %id, "conversation created");
                *conversation = Some(id.clone());
                id
            }
        };

        let mut response = client
            .send_message(&id, Message::Prompt(self.prompt.clone()), &self.tool_choice)
            .context("send phase prompt")?;
        let allowed: Vec<&str> = self.tools.iter().map(|tool| tool.name.as_str()).collect();
        let mut previous: Vec<ToolCallResult> = Vec::new();

        for round in 1..=self.max_tool_rounds {
            match tools
                .handle_tool_response(&response, &allowed, context)
                .context("handle tool calls")?
            {
                ToolOutcome::Terminal(result) => return Ok(result.response),
                ToolOutcome::Stopped => {
                    debug!(round, "agent stopped calling tools");
                    return previous
                        .pop()
                        .map(|result| result.response)
                        .ok_or_else(|| anyhow!("agent finished without calling any tool"));
                }
                ToolOutcome::Continue(results) => {
                    if round == self.max_tool_rounds {
                        break;
                    }
                    debug!(round, results = results.len(), "sending tool results");
                    previous = results.clone();
                    response = client
                        .send_message(&id, Message::ToolResults(results), &ToolChoice::Optional)
                        .context("send tool results")?;
                }
            }
        }
        Err(anyhow!(
            "no final result after {} tool rounds",
            self.max_tool_rounds
        ))
    }
}
