//! The task state machine.
//!
//! Setup, BranchCreation, then Implementation and Validation alternate until
//! the validator accepts the change or attempts run out, then PullRequest.
//! Cleanup always runs. Implementation, FixImplementation and Validation
//! share one conversation; BranchCreation and PullRequest share another.

use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::core::context::{Context, keys};
use crate::core::types::{ConversationId, PhaseKind, PhaseResult};
use crate::core::verdict::{ValidationVerdict, validation_unavailable};
use crate::io::agent::AgentClient;
use crate::io::config::EngineConfig;
use crate::io::prompt::PromptLibrary;
use crate::io::repository::{FileLister, RepositoryLease, RepositoryLifecycle};
use crate::io::task::TaskSpec;
use crate::io::tools::ToolExecutor;
use crate::phase::PhaseOutput;
use crate::workflow::{AbortReason, RunOutcome, Workflow, WorkflowCore};

/// External collaborators of a task run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub client: &'a dyn AgentClient,
    pub tools: &'a dyn ToolExecutor,
    pub repository: &'a dyn RepositoryLifecycle,
    pub files: &'a dyn FileLister,
}

/// Progress notifications. Attempts are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    PhaseStarted {
        phase: PhaseKind,
        attempt: Option<u32>,
    },
    PhaseFinished {
        phase: PhaseKind,
        success: bool,
    },
    ValidationRejected {
        attempt: u32,
        max_attempts: u32,
        issues: String,
    },
    BackingOff {
        delay: Duration,
    },
    CleanedUp,
}

type Observer<'a> = Box<dyn FnMut(&TaskEvent) + 'a>;

/// Runs one task from clone to pull request.
pub struct TaskWorkflow<'a> {
    core: WorkflowCore<'a>,
    task: TaskSpec,
    repository: &'a dyn RepositoryLifecycle,
    files: &'a dyn FileLister,
    max_attempts: u32,
    backoff: Duration,
    lease: Option<RepositoryLease>,
    branch_conversation: Option<ConversationId>,
    implementation_conversation: Option<ConversationId>,
    observer: Option<Observer<'a>>,
}

impl<'a> TaskWorkflow<'a> {
    /// Fails if `config` or `task` does not validate.
    pub fn new(
        task: TaskSpec,
        collaborators: Collaborators<'a>,
        prompts: PromptLibrary,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate().context("invalid engine config")?;
        task.validate().context("invalid task")?;
        let max_attempts = task.attempt_limit(&config);
        let backoff = config.retry_backoff();
        let core = WorkflowCore::new(
            task.seed_context(),
            collaborators.client,
            collaborators.tools,
            prompts,
            config,
        );
        Ok(Self {
            core,
            task,
            repository: collaborators.repository,
            files: collaborators.files,
            max_attempts,
            backoff,
            lease: None,
            branch_conversation: None,
            implementation_conversation: None,
            observer: None,
        })
    }

    pub fn with_observer(mut self, observer: impl FnMut(&TaskEvent) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn context(&self) -> &Context {
        self.core.context()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn emit(&mut self, event: TaskEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&event);
        }
    }

    fn run_phase(
        &mut self,
        kind: PhaseKind,
        conversation: Option<ConversationId>,
        attempt: Option<u32>,
    ) -> Result<PhaseOutput, AbortReason> {
        self.emit(TaskEvent::PhaseStarted {
            phase: kind,
            attempt,
        });
        let phase = self.core.phase(kind, conversation).map_err(|err| {
            error!(phase = %kind, err = %err, "phase construction failed");
            AbortReason::Configuration {
                phase: kind,
                message: err.to_string(),
            }
        })?;
        let output = self.core.execute(&phase);
        self.emit(TaskEvent::PhaseFinished {
            phase: kind,
            success: output.result.success,
        });
        Ok(output)
    }

    fn refresh_files(&mut self) -> Result<(), AbortReason> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| AbortReason::Files("repository is not set up".to_string()))?;
        let files = self
            .files
            .current_files(&lease.clone_path)
            .map_err(|err| AbortReason::Files(format!("{err:#}")))?;
        debug!(count = files.len(), "refreshed file listing");
        self.core.context_mut().insert(keys::CURRENT_FILES, json!(files));
        Ok(())
    }

    fn create_branch(&mut self) -> Result<(), AbortReason> {
        let kind = PhaseKind::BranchCreation;
        let output = self.run_phase(kind, None, None)?;
        self.branch_conversation = output.conversation;
        let branch = required_output(kind, &output.result, "branch_name")?;
        info!(branch = %branch, "working branch created");
        self.core.context_mut().insert(keys::HEAD_BRANCH, branch);
        Ok(())
    }

    fn implement_until_validated(&mut self) -> Result<(), AbortReason> {
        let max = self.max_attempts;
        for attempt in 1..=max {
            self.refresh_files()?;
            let (kind, conversation) = if attempt == 1 {
                (PhaseKind::Implementation, None)
            } else {
                (
                    PhaseKind::FixImplementation,
                    self.implementation_conversation.clone(),
                )
            };
            info!(attempt, max, phase = %kind, "implementation attempt");
            let output = self.run_phase(kind, conversation, Some(attempt))?;
            self.implementation_conversation = output.conversation;
            if !output.result.success {
                return Err(AbortReason::PhaseFailed {
                    phase: kind,
                    error: output.result.error_message().to_string(),
                });
            }

            let output = self.run_phase(
                PhaseKind::Validation,
                self.implementation_conversation.clone(),
                Some(attempt),
            )?;
            if output.conversation.is_some() {
                self.implementation_conversation = output.conversation;
            }
            if !output.result.success {
                let issues = validation_unavailable(output.result.error_message());
                warn!(attempt, max, error = output.result.error_message(), "validation did not complete");
                self.core
                    .context_mut()
                    .insert(keys::PREVIOUS_ISSUES, issues);
                continue;
            }

            let verdict = ValidationVerdict::from_data(&output.result.data);
            if verdict.validated {
                info!(attempt, max, "implementation validated");
                return Ok(());
            }
            let issues = verdict.previous_issues();
            warn!(attempt, max, unmet = verdict.not_met.len(), "validation rejected implementation");
            self.core
                .context_mut()
                .insert(keys::PREVIOUS_ISSUES, issues.clone());
            self.emit(TaskEvent::ValidationRejected {
                attempt,
                max_attempts: max,
                issues,
            });
            if attempt == max {
                break;
            }
            self.back_off();
        }

        Err(AbortReason::AttemptsExhausted {
            attempts: max,
            last_issues: self
                .core
                .context()
                .get_str(keys::PREVIOUS_ISSUES)
                .map(str::to_string),
        })
    }

    fn back_off(&mut self) {
        if self.backoff.is_zero() {
            return;
        }
        self.emit(TaskEvent::BackingOff {
            delay: self.backoff,
        });
        debug!(delay_ms = self.backoff.as_millis() as u64, "backing off before next attempt");
        thread::sleep(self.backoff);
    }

    fn drive(&mut self) -> Result<String, AbortReason> {
        self.create_branch()?;
        self.implement_until_validated()?;
        self.open_pull_request()
    }

    fn open_pull_request(&mut self) -> Result<String, AbortReason> {
        let kind = PhaseKind::PullRequest;
        self.refresh_files()?;
        let output = self.run_phase(kind, self.branch_conversation.clone(), None)?;
        let url = required_output(kind, &output.result, "url")?;
        info!(url = %url, "pull request opened");
        Ok(url)
    }
}

/// Non-empty string `field` from a successful result, else a phase failure.
fn required_output(
    kind: PhaseKind,
    result: &PhaseResult,
    field: &str,
) -> Result<String, AbortReason> {
    if !result.success {
        return Err(AbortReason::PhaseFailed {
            phase: kind,
            error: result.error_message().to_string(),
        });
    }
    result
        .data_str(field)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AbortReason::PhaseFailed {
            phase: kind,
            error: format!("result data has no '{field}'"),
        })
}

impl Workflow for TaskWorkflow<'_> {
    type Output = String;

    #[instrument(skip_all, fields(repository = %crate::io::git::redact_credentials(&self.task.repository_url)))]
    fn setup(&mut self) -> Result<()> {
        let credentials = self.task.resolve_credentials()?;
        let lease = self
            .repository
            .setup_repository(&self.task.repository_url, &credentials)?;
        let clone_path = lease.clone_path.clone();

        let context = self.core.context_mut();
        context.insert(keys::CLONE_PATH, clone_path.display().to_string());
        context.insert(keys::ORIGINAL_DIR, lease.original_dir.display().to_string());
        if !context.contains(keys::BASE_BRANCH) {
            context.insert(keys::BASE_BRANCH, lease.default_branch.clone());
        }
        self.lease = Some(lease);

        let files = self
            .files
            .current_files(&clone_path)
            .map_err(|err| anyhow!("list files in {}: {err:#}", clone_path.display()))?;
        self.core
            .context_mut()
            .insert(keys::CURRENT_FILES, json!(files));
        Ok(())
    }

    fn run_phases(&mut self) -> RunOutcome<String> {
        match self.drive() {
            Ok(url) => RunOutcome::Completed(url),
            Err(reason) => {
                warn!(reason = %reason, "task aborted");
                RunOutcome::Aborted(reason)
            }
        }
    }

    fn cleanup(&mut self) {
        if let Some(lease) = self.lease.take() {
            match self.repository.cleanup_repository(&lease) {
                Ok(()) => debug!(path = %lease.clone_path.display(), "repository cleaned up"),
                Err(err) => warn!(
                    path = %lease.clone_path.display(),
                    err = %format!("{err:#}"),
                    "repository cleanup failed"
                ),
            }
        }
        self.emit(TaskEvent::CleanedUp);
    }
}

/// Seed context plus stand-ins for the values setup and earlier phases write.
///
/// Lets a phase be constructed (and its prompt rendered) without cloning anything.
pub fn preview_context(task: &TaskSpec) -> Context {
    let mut context = task.seed_context();
    let placeholders: [(&str, Value); 6] = [
        (keys::CLONE_PATH, json!("<clone path>")),
        (keys::ORIGINAL_DIR, json!("<original directory>")),
        (keys::BASE_BRANCH, json!("<default branch>")),
        (keys::HEAD_BRANCH, json!("<working branch>")),
        (keys::CURRENT_FILES, json!([])),
        (keys::PREVIOUS_ISSUES, json!("<issues from the previous validation>")),
    ];
    for (key, value) in placeholders {
        if !context.contains(key) {
            context.insert(key, value);
        }
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contract::validate_context;
    use crate::phase::PhaseDefinition;

    fn task() -> TaskSpec {
        toml::from_str(
            r#"
repository_url = "https://github.com/acme/tool.git"
base_branch = "develop"
description = "Add a --verbose flag"
acceptance_criteria = ["flag is parsed"]
"#,
        )
        .expect("task")
    }

    #[test]
    fn preview_context_satisfies_every_phase_contract() {
        let context = preview_context(&task());
        for kind in PhaseKind::ALL {
            let definition = PhaseDefinition::builtin(kind);
            assert!(
                validate_context(&context, &definition.requirement).is_ok(),
                "{kind} contract not satisfied by preview context"
            );
        }
        assert_eq!(context.get_str(keys::BASE_BRANCH), Some("develop"));
    }

    #[test]
    fn required_output_rejects_blank_fields() {
        let mut data = serde_json::Map::new();
        data.insert("url".to_string(), json!("  "));
        let result = PhaseResult::ok(data);
        let err = required_output(PhaseKind::PullRequest, &result, "url").unwrap_err();
        assert_eq!(
            err,
            AbortReason::PhaseFailed {
                phase: PhaseKind::PullRequest,
                error: "result data has no 'url'".to_string(),
            }
        );
    }
}
