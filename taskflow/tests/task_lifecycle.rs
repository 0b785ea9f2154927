//! Task-level scenarios driving `TaskWorkflow` with scripted collaborators.
//!
//! Each test queues the agent turns a run should consume, runs the workflow
//! to completion, and then checks the outcome, the phases that ran (through
//! observer events), the conversations used, and that cleanup happened once.

use std::cell::RefCell;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::Duration;

use serde_json::{Value, json};

use taskflow::core::context::{Context, keys};
use taskflow::core::contract::Shape;
use taskflow::core::types::{ConversationId, PhaseKind, ToolChoice};
use taskflow::io::config::EngineConfig;
use taskflow::io::prompt::PromptLibrary;
use taskflow::io::task::TaskSpec;
use taskflow::io::tools::{
    CREATE_BRANCH, CREATE_PULL_REQUEST, PUSH_BRANCH, SUBMIT_IMPLEMENTATION, SUBMIT_VALIDATION,
    ToolRegistry,
};
use taskflow::phase::{PhaseConstructionError, PhaseDefinition};
use taskflow::task_machine::{Collaborators, TaskEvent, TaskWorkflow, preview_context};
use taskflow::test_support::{
    FAKE_PR_URL, RecordingRepository, ScriptedAgentClient, fake_registry, tool_reply,
};
use taskflow::workflow::{AbortReason, RunOutcome, Workflow, WorkflowCore};

fn task(max_attempts: u32) -> TaskSpec {
    toml::from_str(&format!(
        r#"
repository_url = "https://git.example.test/acme/tool.git"
description = "Add a --verbose flag"
acceptance_criteria = ["flag is parsed", "help text mentions it"]
max_implementation_attempts = {max_attempts}

[author]
name = "Release Bot"
email = "bot@acme.test"

[credentials]
username = "release-bot"
"#
    ))
    .expect("task")
}

fn config() -> EngineConfig {
    EngineConfig {
        retry_backoff_ms: 0,
        ..EngineConfig::default()
    }
}

fn prompts() -> PromptLibrary {
    PromptLibrary::builtin(60_000).expect("prompts")
}

fn branch_created(client: &ScriptedAgentClient) {
    client.push(tool_reply(CREATE_BRANCH, json!({"branch_name": "feature/verbose"})));
}

fn implemented(client: &ScriptedAgentClient) {
    client.push(tool_reply(SUBMIT_IMPLEMENTATION, json!({"summary": "added the flag"})));
}

fn validated(client: &ScriptedAgentClient) {
    client.push(tool_reply(SUBMIT_VALIDATION, json!({"validated": true})));
}

fn rejected(client: &ScriptedAgentClient, not_met: &[&str]) {
    client.push(tool_reply(
        SUBMIT_VALIDATION,
        json!({"validated": false, "not_met": not_met}),
    ));
}

fn pull_request_opened(client: &ScriptedAgentClient) {
    client.push(tool_reply(CREATE_PULL_REQUEST, json!({"title": "Add --verbose"})));
}

/// Event log shared with the workflow observer.
#[derive(Clone, Default)]
struct Events(Rc<RefCell<Vec<TaskEvent>>>);

impl Events {
    fn recorder(&self) -> impl FnMut(&TaskEvent) + 'static {
        let events = Rc::clone(&self.0);
        move |event: &TaskEvent| events.borrow_mut().push(event.clone())
    }

    fn all(&self) -> Vec<TaskEvent> {
        self.0.borrow().clone()
    }

    fn started(&self, kind: PhaseKind) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|event| matches!(event, TaskEvent::PhaseStarted { phase, .. } if *phase == kind))
            .count()
    }

    fn cleanups(&self) -> usize {
        self.0
            .borrow()
            .iter()
            .filter(|event| matches!(event, TaskEvent::CleanedUp))
            .count()
    }
}

fn workflow<'a>(
    task: TaskSpec,
    client: &'a ScriptedAgentClient,
    tools: &'a ToolRegistry,
    repo: &'a RecordingRepository,
    events: &Events,
) -> TaskWorkflow<'a> {
    workflow_with(config(), task, client, tools, repo, events)
}

fn workflow_with<'a>(
    config: EngineConfig,
    task: TaskSpec,
    client: &'a ScriptedAgentClient,
    tools: &'a ToolRegistry,
    repo: &'a RecordingRepository,
    events: &Events,
) -> TaskWorkflow<'a> {
    TaskWorkflow::new(
        task,
        Collaborators {
            client,
            tools,
            repository: repo,
            files: repo,
        },
        prompts(),
        config,
    )
    .expect("workflow")
    .with_observer(events.recorder())
}

/// Two rejections, then acceptance on the last allowed attempt.
///
/// Sequence: BranchCreation, Implementation, Validation (rejected),
/// FixImplementation, Validation (rejected), FixImplementation,
/// Validation (accepted), PullRequest.
#[test]
fn validates_on_final_attempt_then_opens_pull_request() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);
    implemented(&client);
    rejected(&client, &["help text mentions it"]);
    implemented(&client);
    rejected(&client, &["flag is parsed"]);
    implemented(&client);
    validated(&client);
    pull_request_opened(&client);

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let mut flow = workflow(task(3), &client, &tools, &repo, &events);

    let outcome = flow.run().expect("run");
    assert_eq!(outcome, RunOutcome::Completed(FAKE_PR_URL.to_string()));
    client.assert_drained();

    assert_eq!(events.started(PhaseKind::BranchCreation), 1);
    assert_eq!(events.started(PhaseKind::Implementation), 1);
    assert_eq!(events.started(PhaseKind::FixImplementation), 2);
    assert_eq!(events.started(PhaseKind::Validation), 3);
    assert_eq!(events.started(PhaseKind::PullRequest), 1);
    assert_eq!(events.cleanups(), 1);
    assert_eq!((repo.setups(), repo.cleanups()), (1, 1));
    // Setup, one refresh per attempt, and one before the pull request.
    assert_eq!(repo.listings(), 5);

    let rejections: Vec<u32> = events
        .all()
        .iter()
        .filter_map(|event| match event {
            TaskEvent::ValidationRejected {
                attempt,
                max_attempts: 3,
                ..
            } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(rejections, vec![1, 2]);

    // Two conversations: branch/PR and implementation/validation.
    let created = client.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].tools, vec!["list_files", CREATE_BRANCH]);
    let branch_conv = ConversationId::new("conv-1");
    let impl_conv = ConversationId::new("conv-2");
    let sent = client.sent();
    assert_eq!(
        sent.first().map(|s| (&s.conversation, &s.tool_choice)),
        Some((&branch_conv, &ToolChoice::Required(CREATE_BRANCH.to_string())))
    );
    assert_eq!(
        sent.last().map(|s| (&s.conversation, &s.tool_choice)),
        Some((
            &branch_conv,
            &ToolChoice::Required(CREATE_PULL_REQUEST.to_string())
        ))
    );
    assert!(
        sent[1..sent.len() - 1]
            .iter()
            .all(|s| s.conversation == impl_conv)
    );
    assert!(client.tool_updates().contains(&(
        branch_conv,
        vec![PUSH_BRANCH.to_string(), CREATE_PULL_REQUEST.to_string()]
    )));

    // Each fix prompt carries the issues from the validation before it.
    let prompts = client.prompts();
    let fixes: Vec<&String> = prompts.iter().filter(|p| p.contains("### Fix Contract")).collect();
    assert_eq!(fixes.len(), 2);
    assert!(fixes[0].contains("not met:\n- help text mentions it"));
    assert!(fixes[1].contains("not met:\n- flag is parsed"));

    let ctx = flow.context();
    assert_eq!(ctx.get_str(keys::HEAD_BRANCH), Some("feature/verbose"));
    assert_eq!(ctx.get_str(keys::BASE_BRANCH), Some("main"));
    assert_eq!(
        ctx.get_str(keys::CLONE_PATH),
        Some(repo.clone_path().to_str().expect("utf8"))
    );
}

#[test]
fn validated_on_first_attempt_skips_fixes() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);
    implemented(&client);
    validated(&client);
    pull_request_opened(&client);

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    repo.set_files(&["Cargo.toml", "src/cli.rs", "src/main.rs"]);
    let events = Events::default();
    let outcome = workflow(task(3), &client, &tools, &repo, &events)
        .run()
        .expect("run");

    assert!(outcome.is_completed());
    let implementation_prompt = &client.prompts()[1];
    assert!(implementation_prompt.contains("- src/cli.rs"));
    assert_eq!(events.started(PhaseKind::FixImplementation), 0);
    assert_eq!(events.started(PhaseKind::Validation), 1);
    assert!(!events
        .all()
        .iter()
        .any(|event| matches!(event, TaskEvent::BackingOff { .. })));
    client.assert_drained();
}

#[test]
fn single_attempt_rejected_aborts_without_pull_request() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);
    implemented(&client);
    rejected(&client, &["flag is parsed"]);

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let outcome = workflow(task(1), &client, &tools, &repo, &events)
        .run()
        .expect("run");

    let RunOutcome::Aborted(AbortReason::AttemptsExhausted {
        attempts,
        last_issues,
    }) = &outcome
    else {
        panic!("expected exhausted attempts, got {outcome:?}");
    };
    assert_eq!(*attempts, 1);
    assert!(last_issues.as_deref().expect("issues").contains("- flag is parsed"));
    assert_eq!(events.started(PhaseKind::PullRequest), 0);
    assert_eq!(repo.cleanups(), 1);
    client.assert_drained();
}

#[test]
fn branch_creation_failure_aborts_before_implementation() {
    let client = ScriptedAgentClient::new();
    client.push_error("agent unavailable");

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let outcome = workflow(task(3), &client, &tools, &repo, &events)
        .run()
        .expect("run");

    let RunOutcome::Aborted(AbortReason::PhaseFailed { phase, error }) = &outcome else {
        panic!("expected phase failure, got {outcome:?}");
    };
    assert_eq!(*phase, PhaseKind::BranchCreation);
    assert!(error.contains("agent unavailable"));
    assert_eq!(events.started(PhaseKind::Implementation), 0);
    assert_eq!(events.cleanups(), 1);
    assert_eq!(repo.cleanups(), 1);
}

#[test]
fn setup_failure_is_returned_after_cleanup() {
    let client = ScriptedAgentClient::new();
    let tools = fake_registry();
    let repo = RecordingRepository::failing_setup();
    let events = Events::default();

    let err = workflow(task(3), &client, &tools, &repo, &events)
        .run()
        .unwrap_err();

    assert!(format!("{err:#}").contains("clone refused"));
    assert_eq!(events.all(), vec![TaskEvent::CleanedUp]);
    assert!(client.created().is_empty());
    // Nothing was acquired, so there is nothing to release.
    assert_eq!(repo.cleanups(), 0);
    assert_eq!(
        repo.last_credentials().and_then(|c| c.username),
        Some("release-bot".to_string())
    );
}

#[test]
fn cleanup_runs_once_when_a_collaborator_panics() {
    // An empty script makes the first send_message panic.
    let client = ScriptedAgentClient::new();
    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let mut flow = workflow(task(3), &client, &tools, &repo, &events);

    let result = catch_unwind(AssertUnwindSafe(|| flow.run()));

    assert!(result.is_err());
    assert_eq!(repo.cleanups(), 1);
    assert_eq!(events.cleanups(), 1);
}

#[test]
fn validation_transport_failure_consumes_an_attempt() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);
    implemented(&client);
    client.push_error("stream closed");
    implemented(&client);
    validated(&client);
    pull_request_opened(&client);

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let outcome = workflow(task(2), &client, &tools, &repo, &events)
        .run()
        .expect("run");

    assert!(outcome.is_completed());
    assert_eq!(events.started(PhaseKind::Implementation), 1);
    assert_eq!(events.started(PhaseKind::FixImplementation), 1);
    let fix_prompt = client
        .prompts()
        .into_iter()
        .find(|p| p.contains("### Fix Contract"))
        .expect("fix prompt");
    assert!(fix_prompt.contains("Validation could not be completed"));
    assert!(fix_prompt.contains("stream closed"));
    client.assert_drained();
}

#[test]
fn validation_transport_failure_on_last_attempt_aborts() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);
    implemented(&client);
    client.push_error("stream closed");

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let outcome = workflow(task(1), &client, &tools, &repo, &events)
        .run()
        .expect("run");

    assert!(matches!(
        outcome,
        RunOutcome::Aborted(AbortReason::AttemptsExhausted { attempts: 1, .. })
    ));
    assert_eq!(events.started(PhaseKind::PullRequest), 0);
}

#[test]
fn implementation_failure_aborts_immediately() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);
    client.push(tool_reply(
        SUBMIT_IMPLEMENTATION,
        json!({"summary": "gave up"}),
    ));
    rejected(&client, &["flag is parsed"]);
    client.push_error("rate limited");

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let outcome = workflow(task(3), &client, &tools, &repo, &events)
        .run()
        .expect("run");

    assert_eq!(
        outcome,
        RunOutcome::Aborted(AbortReason::PhaseFailed {
            phase: PhaseKind::FixImplementation,
            error: "send phase prompt: rate limited".to_string(),
        })
    );
    assert_eq!(events.started(PhaseKind::Validation), 1);
    client.assert_drained();
}

#[test]
fn file_listing_failure_mid_run_aborts() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let mut record = events.recorder();
    let repo_ref = &repo;
    let mut flow = TaskWorkflow::new(
        task(3),
        Collaborators {
            client: &client,
            tools: &tools,
            repository: &repo,
            files: &repo,
        },
        prompts(),
        config(),
    )
    .expect("workflow")
    .with_observer(move |event| {
        if matches!(
            event,
            TaskEvent::PhaseFinished {
                phase: PhaseKind::BranchCreation,
                ..
            }
        ) {
            repo_ref.fail_listing(true);
        }
        record(event);
    });

    let outcome = flow.run().expect("run");
    assert!(matches!(outcome, RunOutcome::Aborted(AbortReason::Files(ref msg)) if msg.contains("vanished")));
    assert_eq!(events.started(PhaseKind::Implementation), 0);
    assert_eq!(repo.cleanups(), 1);
}

#[test]
fn unresolved_template_placeholder_aborts_before_any_agent_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(
        dir.path().join("branch_creation.md"),
        "Create a branch for ticket {{ ticket_id }}.",
    )
    .expect("write template");
    let prompts = PromptLibrary::load(Some(dir.path()), 60_000).expect("prompts");

    let client = ScriptedAgentClient::new();
    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let outcome = TaskWorkflow::new(
        task(3),
        Collaborators {
            client: &client,
            tools: &tools,
            repository: &repo,
            files: &repo,
        },
        prompts,
        config(),
    )
    .expect("workflow")
    .run()
    .expect("run");

    assert!(matches!(
        outcome,
        RunOutcome::Aborted(AbortReason::Configuration {
            phase: PhaseKind::BranchCreation,
            ..
        })
    ));
    assert!(client.created().is_empty());
    assert!(client.sent().is_empty());
    assert_eq!(repo.cleanups(), 1);
}

#[test]
fn missing_context_key_fails_construction_without_calling_the_agent() {
    let client = ScriptedAgentClient::new();
    let tools = fake_registry();
    let mut context = Context::new();
    context.insert(keys::TASK_DESCRIPTION, "Add a --verbose flag");
    let core = WorkflowCore::new(context, &client, &tools, prompts(), config());

    let err = core.phase(PhaseKind::Validation, None).unwrap_err();

    let PhaseConstructionError::Contract(contract) = &err else {
        panic!("expected contract error, got {err:?}");
    };
    let missing: Vec<&str> = contract.violations.iter().map(|v| v.key()).collect();
    assert_eq!(missing, vec![keys::ACCEPTANCE_CRITERIA, keys::CLONE_PATH]);
    assert!(contract.to_string().contains("acceptance_criteria: list<string>"));
    assert!(client.created().is_empty());
    assert!(client.sent().is_empty());
}

#[test]
fn wrong_shape_names_the_key() {
    let client = ScriptedAgentClient::new();
    let tools = fake_registry();
    let context = Context::from_seeds([
        (keys::TASK_DESCRIPTION, json!("Add a --verbose flag")),
        (keys::ACCEPTANCE_CRITERIA, json!("flag is parsed")),
        (keys::CLONE_PATH, json!("/work/tool")),
    ]);
    let core = WorkflowCore::new(context, &client, &tools, prompts(), config());

    let err = core.phase(PhaseKind::Validation, None).unwrap_err();

    let message = err.to_string();
    assert!(
        message.contains("'acceptance_criteria': expected list<string>, found string"),
        "{message}"
    );
}

/// A value of a different JSON kind than `shape` expects, if one exists.
fn mismatched(shape: &Shape) -> Option<Value> {
    match shape {
        Shape::Any => None,
        Shape::Optional(inner) => mismatched(inner),
        Shape::Integer | Shape::Number => Some(json!("not a number")),
        _ => Some(json!(42)),
    }
}

/// Every phase, every declared key: dropping it or giving it the wrong shape
/// fails construction with a violation naming that key, before any agent call.
#[test]
fn every_declared_key_is_enforced_for_every_phase() {
    let base = preview_context(&task(3));
    let tools = fake_registry();

    for kind in PhaseKind::ALL {
        let definition = PhaseDefinition::builtin(kind);
        for requirement in definition.requirement.iter() {
            let key = requirement.key;
            let without = Context::from_seeds(
                base.keys()
                    .filter(|name| *name != key)
                    .filter_map(|name| base.get(name).map(|value| (name, value.clone()))),
            );
            let mut cases = Vec::new();
            if !matches!(requirement.shape, Shape::Optional(_)) {
                cases.push(("missing", without));
            }
            if let Some(value) = mismatched(&requirement.shape) {
                let mut wrong = base.clone();
                wrong.insert(key, value);
                cases.push(("wrong shape", wrong));
            }

            for (case, context) in cases {
                let client = ScriptedAgentClient::new();
                let core = WorkflowCore::new(context, &client, &tools, prompts(), config());
                let err = core.phase(kind, None).unwrap_err();
                let PhaseConstructionError::Contract(contract) = &err else {
                    panic!("{kind}/{key}/{case}: expected contract error, got {err:?}");
                };
                let named: Vec<&str> = contract.violations.iter().map(|v| v.key()).collect();
                assert_eq!(named, vec![key], "{kind}/{case}");
                assert!(client.created().is_empty(), "{kind}/{key}/{case}");
                assert!(client.sent().is_empty(), "{kind}/{key}/{case}");
            }
        }
    }
}

/// Backoff sits between a rejection and the next attempt only: not after a
/// validation that could not complete, and not after the last attempt.
#[test]
fn backoff_follows_each_non_final_rejection() {
    let client = ScriptedAgentClient::new();
    branch_created(&client);
    implemented(&client);
    rejected(&client, &["flag is parsed"]);
    implemented(&client);
    rejected(&client, &["flag is parsed"]);
    implemented(&client);
    client.push_error("stream closed");
    implemented(&client);
    rejected(&client, &["help text mentions it"]);

    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let events = Events::default();
    let config = EngineConfig {
        retry_backoff_ms: 5,
        ..EngineConfig::default()
    };
    let outcome = workflow_with(config, task(4), &client, &tools, &repo, &events)
        .run()
        .expect("run");

    assert!(matches!(
        outcome,
        RunOutcome::Aborted(AbortReason::AttemptsExhausted { attempts: 4, .. })
    ));
    let delay = Duration::from_millis(5);
    let retry_events: Vec<TaskEvent> = events
        .all()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                TaskEvent::ValidationRejected { .. } | TaskEvent::BackingOff { .. }
            )
        })
        .collect();
    let rejection = |attempt: u32, issue: &str| TaskEvent::ValidationRejected {
        attempt,
        max_attempts: 4,
        issues: format!("Validation failed. These acceptance criteria are not met:\n- {issue}"),
    };
    assert_eq!(
        retry_events,
        vec![
            rejection(1, "flag is parsed"),
            TaskEvent::BackingOff { delay },
            rejection(2, "flag is parsed"),
            TaskEvent::BackingOff { delay },
            rejection(4, "help text mentions it"),
        ]
    );
    client.assert_drained();
}

#[test]
fn invalid_config_or_task_is_rejected_at_construction() {
    let client = ScriptedAgentClient::new();
    let tools = fake_registry();
    let repo = RecordingRepository::new();
    let collaborators = Collaborators {
        client: &client,
        tools: &tools,
        repository: &repo,
        files: &repo,
    };

    let no_rounds = EngineConfig {
        max_tool_rounds: 0,
        ..EngineConfig::default()
    };
    let Err(err) = TaskWorkflow::new(task(3), collaborators, prompts(), no_rounds) else {
        panic!("zero tool rounds accepted");
    };
    assert!(format!("{err:#}").contains("max_tool_rounds must be > 0"));

    let mut no_criteria = task(3);
    no_criteria.acceptance_criteria.clear();
    let Err(err) = TaskWorkflow::new(no_criteria, collaborators, prompts(), config()) else {
        panic!("task without criteria accepted");
    };
    assert!(format!("{err:#}").contains("acceptance_criteria"));
    assert_eq!(repo.setups(), 0);
}
