//! Phase prompt templates.
//!
//! Templates are minijinja documents split into sections with
//! `<!-- section:KEY required|droppable -->` markers. Rendering is strict: a
//! placeholder the context does not provide is an error, never an empty
//! string. After rendering, droppable sections are removed until the prompt
//! fits the byte budget.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::core::context::Context;

/// Name of the template rendered as every conversation's system prompt.
pub const SYSTEM_TEMPLATE: &str = "system";

const BUILTIN_TEMPLATES: [(&str, &str); 6] = [
    (SYSTEM_TEMPLATE, include_str!("prompts/system.md")),
    ("branch_creation", include_str!("prompts/branch_creation.md")),
    ("implementation", include_str!("prompts/implementation.md")),
    ("fix_implementation", include_str!("prompts/fix_implementation.md")),
    ("validation", include_str!("prompts/validation.md")),
    ("pull_request", include_str!("prompts/pull_request.md")),
];

/// Sections removed, in order, when a prompt is over budget.
const DROP_ORDER: [&str; 1] = ["files"];

const TRUNCATION_MARKER: &str = "\n[truncated]";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unknown prompt template '{0}'")]
    UnknownTemplate(String),
    #[error("read prompt template {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid prompt template '{name}': {source}")]
    Syntax {
        name: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("render prompt template '{name}': {source}")]
    Render {
        name: String,
        #[source]
        source: minijinja::Error,
    },
}

/// Loaded templates plus the byte budget applied to every rendered prompt.
#[derive(Debug)]
pub struct PromptLibrary {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptLibrary {
    /// Library with only the built-in templates.
    pub fn builtin(budget_bytes: usize) -> Result<Self, PromptError> {
        Self::load(None, budget_bytes)
    }

    /// Built-in templates, each replaced by `<dir>/<name>.md` when that file exists.
    pub fn load(dir: Option<&Path>, budget_bytes: usize) -> Result<Self, PromptError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        for (name, builtin) in BUILTIN_TEMPLATES {
            let override_path = dir.map(|dir| dir.join(format!("{name}.md")));
            let added = match override_path.filter(|path| path.is_file()) {
                Some(path) => {
                    let source = fs::read_to_string(&path).map_err(|source| PromptError::Read {
                        path: path.clone(),
                        source,
                    })?;
                    debug!(template = name, path = %path.display(), "using template override");
                    env.add_template_owned(name, source)
                }
                None => env.add_template(name, builtin),
            };
            added.map_err(|source| PromptError::Syntax {
                name: name.to_string(),
                source,
            })?;
        }
        Ok(Self { env, budget_bytes })
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    /// Render `name` against `context`, then fit it into the byte budget.
    pub fn render(&self, name: &str, context: &Context) -> Result<String, PromptError> {
        let template = self
            .env
            .get_template(name)
            .map_err(|_| PromptError::UnknownTemplate(name.to_string()))?;
        let rendered = template.render(context).map_err(|source| PromptError::Render {
            name: name.to_string(),
            source,
        })?;

        let mut sections = parse_sections(&rendered);
        if sections.is_empty() {
            sections.push(ParsedSection {
                key: "body".to_string(),
                required: true,
                content: rendered.trim().to_string(),
            });
        }
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("static regex")
});

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (_, [key, mode]) = caps.extract();
        let start = caps.get(0).map_or(0, |m| m.end());
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());

        let content = rendered[start..end].trim().to_string();
        let required = mode == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections in [`DROP_ORDER`], then truncate the last section.
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(rest));
    let before_len = last.content.len();
    if before_len > allowed {
        if allowed > TRUNCATION_MARKER.len() {
            truncate_at_char_boundary(&mut last.content, allowed - TRUNCATION_MARKER.len());
            last.content.push_str(TRUNCATION_MARKER);
        } else {
            truncate_at_char_boundary(&mut last.content, allowed);
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    let mut cut = max.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::keys;
    use serde_json::json;

    fn implementation_context(files: usize) -> Context {
        let mut ctx = Context::new();
        ctx.insert(keys::TASK_DESCRIPTION, "Add a --verbose flag");
        ctx.insert(
            keys::ACCEPTANCE_CRITERIA,
            json!(["flag is parsed", "help text mentions it"]),
        );
        ctx.insert(keys::HEAD_BRANCH, "feature/verbose");
        let files: Vec<String> = (0..files).map(|i| format!("src/module_{i}.rs")).collect();
        ctx.insert(keys::CURRENT_FILES, json!(files));
        ctx
    }

    #[test]
    fn every_phase_template_is_present() {
        let library = PromptLibrary::builtin(60_000).expect("library");
        for kind in crate::core::types::PhaseKind::ALL {
            assert!(library.has_template(kind.as_str()), "missing {kind}");
        }
        assert!(library.has_template(SYSTEM_TEMPLATE));
    }

    #[test]
    fn renders_sections_in_order() {
        let library = PromptLibrary::builtin(60_000).expect("library");
        let prompt = library
            .render("implementation", &implementation_context(2))
            .expect("render");

        let contract = prompt.find("### Implementation Contract").expect("contract");
        let task = prompt.find("### Task").expect("task");
        let criteria = prompt.find("### Acceptance Criteria").expect("criteria");
        let files = prompt.find("### Repository Files").expect("files");
        assert!(contract < task && task < criteria && criteria < files);
        assert!(prompt.contains("`feature/verbose`"));
        assert!(prompt.contains("- help text mentions it"));
        assert!(prompt.contains("- src/module_1.rs"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn missing_placeholder_is_an_error() {
        let library = PromptLibrary::builtin(60_000).expect("library");
        let mut ctx = implementation_context(1);
        ctx.insert(keys::PREVIOUS_ISSUES, "tests fail");
        let ok = library.render("fix_implementation", &ctx);
        assert!(ok.is_ok());

        let err = library
            .render("fix_implementation", &implementation_context(1))
            .unwrap_err();
        assert!(matches!(err, PromptError::Render { ref name, .. } if name == "fix_implementation"));
    }

    #[test]
    fn unknown_template_is_an_error() {
        let library = PromptLibrary::builtin(60_000).expect("library");
        let err = library.render("deploy", &Context::new()).unwrap_err();
        assert!(matches!(err, PromptError::UnknownTemplate(ref name) if name == "deploy"));
    }

    #[test]
    fn budget_drops_file_listing_first() {
        let library = PromptLibrary::builtin(1_200).expect("library");
        let prompt = library
            .render("implementation", &implementation_context(200))
            .expect("render");
        assert!(!prompt.contains("### Repository Files"));
        assert!(prompt.contains("### Implementation Contract"));
        assert!(prompt.contains("### Acceptance Criteria"));
        assert!(prompt.len() <= 1_200);
    }

    #[test]
    fn budget_truncates_when_dropping_is_not_enough() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("validation.md"),
            "<!-- section:head required -->\nReview\n<!-- section:body required -->\n{{ task_description }}",
        )
        .expect("write");
        let library = PromptLibrary::load(Some(temp.path()), 100).expect("library");
        let mut ctx = Context::new();
        ctx.insert(keys::TASK_DESCRIPTION, "é".repeat(500));
        let prompt = library.render("validation", &ctx).expect("render");
        assert!(prompt.starts_with("Review\n\n"));
        assert!(prompt.ends_with("[truncated]"));
        assert!(prompt.len() < 110);
    }

    #[test]
    fn directory_overrides_replace_builtins() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("validation.md"),
            "Check {{ task_description }} carefully.",
        )
        .expect("write");
        let library = PromptLibrary::load(Some(temp.path()), 60_000).expect("library");
        let prompt = library
            .render("validation", &implementation_context(0))
            .expect("render");
        assert_eq!(prompt, "Check Add a --verbose flag carefully.");
        assert!(
            library
                .render("implementation", &implementation_context(0))
                .expect("render")
                .contains("### Implementation Contract")
        );
    }

    #[test]
    fn broken_override_is_a_syntax_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("system.md"), "{% if %}").expect("write");
        let err = PromptLibrary::load(Some(temp.path()), 60_000).unwrap_err();
        assert!(matches!(err, PromptError::Syntax { ref name, .. } if name == "system"));
    }
}
