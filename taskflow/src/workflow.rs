//! Workflow scaffolding shared by every phase sequence.
//!
//! A [`Workflow`] acquires resources in `setup`, runs its phases, and
//! releases resources in `cleanup`. The provided [`Workflow::run`] ties
//! `cleanup` to a drop guard, so it runs exactly once per call whether
//! `setup` fails, the phases return, or something panics.

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::context::Context;
use crate::core::types::{ConversationId, PhaseKind};
use crate::io::agent::AgentClient;
use crate::io::config::EngineConfig;
use crate::io::prompt::PromptLibrary;
use crate::io::tools::ToolExecutor;
use crate::phase::{Phase, PhaseConstructionError, PhaseDefinition, PhaseEnv, PhaseOutput};

/// Why a run stopped before producing its output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    /// A phase could not be constructed (contract, tools, or template).
    #[error("configuration error: {message}")]
    Configuration { phase: PhaseKind, message: String },
    #[error("phase '{phase}' failed: {error}")]
    PhaseFailed { phase: PhaseKind, error: String },
    #[error("not validated after {attempts} attempt(s)")]
    AttemptsExhausted {
        attempts: u32,
        last_issues: Option<String>,
    },
    /// The working copy could not be listed.
    #[error("listing repository files failed: {0}")]
    Files(String),
}

/// Terminal state of a run that got past setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Completed(T),
    Aborted(AbortReason),
}

impl<T> RunOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            RunOutcome::Aborted(_) => None,
        }
    }
}

/// State every workflow owns: one context plus the collaborators that phases use.
pub struct WorkflowCore<'a> {
    context: Context,
    client: &'a dyn AgentClient,
    tools: &'a dyn ToolExecutor,
    prompts: PromptLibrary,
    config: EngineConfig,
}

impl<'a> WorkflowCore<'a> {
    pub fn new(
        context: Context,
        client: &'a dyn AgentClient,
        tools: &'a dyn ToolExecutor,
        prompts: PromptLibrary,
        config: EngineConfig,
    ) -> Self {
        Self {
            context,
            client,
            tools,
            prompts,
            config,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Construct the built-in phase of `kind` against the current context.
    pub fn phase(
        &self,
        kind: PhaseKind,
        conversation: Option<ConversationId>,
    ) -> Result<Phase, PhaseConstructionError> {
        self.phase_from(&PhaseDefinition::builtin(kind), conversation)
    }

    pub fn phase_from(
        &self,
        definition: &PhaseDefinition,
        conversation: Option<ConversationId>,
    ) -> Result<Phase, PhaseConstructionError> {
        let env = PhaseEnv {
            context: &self.context,
            prompts: &self.prompts,
            tools: self.tools,
            max_tool_rounds: self.config.max_tool_rounds,
        };
        Phase::new(definition, &env, conversation)
    }

    #[instrument(skip_all, fields(phase = %phase.kind()))]
    pub fn execute(&self, phase: &Phase) -> PhaseOutput {
        debug!(conversation = ?phase.conversation(), "executing phase");
        phase.execute(self.client, self.tools, &self.context)
    }
}

/// A phase sequence with guaranteed resource release.
pub trait Workflow {
    type Output;

    /// Acquire resources. An error here skips the phases but not `cleanup`.
    fn setup(&mut self) -> Result<()>;

    fn run_phases(&mut self) -> RunOutcome<Self::Output>;

    /// Release whatever `setup` acquired. Must not panic.
    fn cleanup(&mut self);

    /// Run `setup` and the phases, then `cleanup` exactly once.
    fn run(&mut self) -> Result<RunOutcome<Self::Output>>
    where
        Self: Sized,
    {
        let guard = CleanupGuard { workflow: self };
        guard.workflow.setup()?;
        Ok(guard.workflow.run_phases())
    }
}

/// Calls [`Workflow::cleanup`] when dropped, including during unwinding.
struct CleanupGuard<'w, W: Workflow> {
    workflow: &'w mut W,
}

impl<W: Workflow> Drop for CleanupGuard<'_, W> {
    fn drop(&mut self) {
        self.workflow.cleanup();
    }
}
