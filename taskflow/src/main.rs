//! `taskflow` command line: inspect a task file before handing it to the engine.
//!
//! `check` loads the config and task and prints the phase plan; `prompt`
//! renders one phase's prompt against the task's seed context. Neither
//! command clones anything or talks to an agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taskflow::core::types::PhaseKind;
use taskflow::exit_codes;
use taskflow::io::config::{EngineConfig, load_config};
use taskflow::io::git::redact_credentials;
use taskflow::io::prompt::{PromptLibrary, SYSTEM_TEMPLATE};
use taskflow::io::task::{TaskSpec, load_task};
use taskflow::logging;
use taskflow::phase::{PhaseConstructionError, PhaseDefinition};
use taskflow::task_machine::preview_context;

const DEFAULT_CONFIG: &str = "taskflow.toml";

#[derive(Parser)]
#[command(
    name = "taskflow",
    version,
    about = "Phase-based task engine for a coding agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate config and task, then print every phase with its tools and required context.
    Check {
        task: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Render one phase's prompt with placeholder values for setup-time context.
    Prompt {
        task: PathBuf,
        #[arg(long, value_parser = parse_phase)]
        phase: PhaseKind,
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Print the system prompt before the phase prompt.
        #[arg(long)]
        system: bool,
    },
}

fn parse_phase(raw: &str) -> Result<PhaseKind, String> {
    PhaseKind::parse(raw).ok_or_else(|| {
        let names: Vec<&str> = PhaseKind::ALL.iter().map(|kind| kind.as_str()).collect();
        format!("unknown phase '{raw}' (expected one of: {})", names.join(", "))
    })
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Check { task, config } => cmd_check(&task, &config),
        Command::Prompt {
            task,
            phase,
            config,
            system,
        } => cmd_prompt(&task, phase, &config, system),
    }
}

fn load_inputs(task_path: &Path, config_path: &Path) -> Result<(TaskSpec, EngineConfig, PromptLibrary)> {
    let config = load_config(config_path)?;
    let task = load_task(task_path)?;
    let prompts = PromptLibrary::load(config.prompt_dir.as_deref(), config.prompt_budget_bytes)
        .context("load prompt templates")?;
    Ok((task, config, prompts))
}

fn cmd_check(task_path: &Path, config_path: &Path) -> Result<i32> {
    let (task, config, prompts) = load_inputs(task_path, config_path)?;
    let context = preview_context(&task);

    println!("repository: {}", redact_credentials(&task.repository_url));
    println!(
        "base branch: {}",
        task.base_branch.as_deref().unwrap_or("(remote default)")
    );
    println!("attempts: {}", task.attempt_limit(&config));
    println!("acceptance criteria: {}", task.acceptance_criteria.len());

    let mut failures = 0;
    for kind in PhaseKind::ALL {
        let definition = PhaseDefinition::builtin(kind);
        println!();
        println!("{kind}");
        println!("  template: {}", definition.template);
        match definition.required_tool {
            Some(required) => println!(
                "  tools: {} (first call: {required})",
                definition.tools.join(", ")
            ),
            None => println!("  tools: {}", definition.tools.join(", ")),
        }
        println!("  context:");
        for line in definition.requirement.to_string().lines() {
            println!("  {line}");
        }
        if let Err(err) = preview(&definition, &context, &prompts) {
            failures += 1;
            println!("  error: {err}");
        }
    }

    if failures > 0 {
        eprintln!("{failures} phase(s) cannot be constructed");
        return Ok(exit_codes::PHASE_CONFIGURATION);
    }
    Ok(exit_codes::OK)
}

fn cmd_prompt(task_path: &Path, kind: PhaseKind, config_path: &Path, system: bool) -> Result<i32> {
    let (task, _config, prompts) = load_inputs(task_path, config_path)?;
    let context = preview_context(&task);
    let definition = PhaseDefinition::builtin(kind);

    let rendered = match preview(&definition, &context, &prompts) {
        Ok(rendered) => rendered,
        Err(err) => {
            eprintln!("{err}");
            return Ok(exit_codes::PHASE_CONFIGURATION);
        }
    };
    if system {
        let system_prompt = prompts
            .render(SYSTEM_TEMPLATE, &context)
            .context("render system prompt")?;
        println!("{system_prompt}");
        println!();
        println!("---");
        println!();
    }
    println!("{rendered}");
    Ok(exit_codes::OK)
}

/// Contract check plus prompt rendering; tools are left to the embedding application.
fn preview(
    definition: &PhaseDefinition,
    context: &taskflow::core::context::Context,
    prompts: &PromptLibrary,
) -> Result<String, PhaseConstructionError> {
    definition.check_context(context)?;
    definition.render_prompt(context, prompts)
}
