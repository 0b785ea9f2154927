//! Context contracts: which keys a phase needs, and in which shape.
//!
//! A [`ContextRequirement`] is declared per phase and checked once, when the
//! phase is constructed. Checking is structural: a value satisfies a
//! [`Shape`] based on its observed JSON kind, recursing through lists, maps
//! and optionals. Every violation is collected, not just the first.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::core::context::Context;

/// Expected shape of a context value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    String,
    Integer,
    /// Any JSON number (integers included).
    Number,
    Bool,
    /// A structured object with arbitrary fields.
    Object,
    /// Anything except an absent key.
    Any,
    List(Box<Shape>),
    /// Absent or null is fine; otherwise the inner shape must match.
    Optional(Box<Shape>),
    /// Object whose keys match the first shape and values the second.
    Map(Box<Shape>, Box<Shape>),
}

impl Shape {
    pub fn list(inner: Shape) -> Self {
        Shape::List(Box::new(inner))
    }

    pub fn optional(inner: Shape) -> Self {
        Shape::Optional(Box::new(inner))
    }

    pub fn map(key: Shape, value: Shape) -> Self {
        Shape::Map(Box::new(key), Box::new(value))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::String => f.write_str("string"),
            Shape::Integer => f.write_str("integer"),
            Shape::Number => f.write_str("number"),
            Shape::Bool => f.write_str("bool"),
            Shape::Object => f.write_str("object"),
            Shape::Any => f.write_str("any"),
            Shape::List(inner) => write!(f, "list<{inner}>"),
            Shape::Optional(inner) => write!(f, "optional<{inner}>"),
            Shape::Map(key, value) => write!(f, "map<{key}, {value}>"),
        }
    }
}

/// One required context key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: &'static str,
    pub shape: Shape,
}

/// Keys a phase reads from the context, split by consumer.
///
/// `prompt` keys are interpolated into the phase template; `tools` keys are
/// read by tool handlers while the phase runs. The union is the full set of
/// keys the phase needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextRequirement {
    pub prompt: Vec<Requirement>,
    pub tools: Vec<Requirement>,
}

impl ContextRequirement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prompt(mut self, key: &'static str, shape: Shape) -> Self {
        self.prompt.push(Requirement { key, shape });
        self
    }

    pub fn tool(mut self, key: &'static str, shape: Shape) -> Self {
        self.tools.push(Requirement { key, shape });
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.prompt.iter().chain(self.tools.iter())
    }
}

impl fmt::Display for ContextRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_group(f, "prompt", &self.prompt)?;
        f.write_str("\n")?;
        write_group(f, "tools", &self.tools)
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, label: &str, group: &[Requirement]) -> fmt::Result {
    write!(f, "  {label}:")?;
    if group.is_empty() {
        return f.write_str(" (none)");
    }
    for req in group {
        write!(f, "\n    {}: {}", req.key, req.shape)?;
    }
    Ok(())
}

/// A single contract failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    Missing {
        key: String,
        expected: String,
    },
    Mismatch {
        key: String,
        /// Location of the offending value, e.g. `acceptance_criteria[2]`.
        path: String,
        expected: String,
        found: &'static str,
    },
}

impl Violation {
    pub fn key(&self) -> &str {
        match self {
            Violation::Missing { key, .. } | Violation::Mismatch { key, .. } => key,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Missing { key, expected } => {
                write!(f, "missing key '{key}' (expected {expected})")
            }
            Violation::Mismatch {
                path,
                expected,
                found,
                ..
            } => write!(f, "'{path}': expected {expected}, found {found}"),
        }
    }
}

/// Construction-time failure listing every violation plus the full requirement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("context contract violated for phase '{phase}':\n- {}\nrequired context:\n{requirement}", join_violations(.violations))]
pub struct ContractError {
    pub phase: String,
    pub violations: Vec<Violation>,
    pub requirement: ContextRequirement,
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n- ")
}

/// Check `context` against `requirement`.
///
/// Returns every violation found, in requirement order.
pub fn validate_context(
    context: &Context,
    requirement: &ContextRequirement,
) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();
    for req in requirement.iter() {
        match context.get(req.key) {
            None => {
                if !matches!(req.shape, Shape::Optional(_)) {
                    violations.push(Violation::Missing {
                        key: req.key.to_string(),
                        expected: req.shape.to_string(),
                    });
                }
            }
            Some(value) => check_shape(req.key, req.key, value, &req.shape, &mut violations),
        }
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn check_shape(key: &str, path: &str, value: &Value, shape: &Shape, out: &mut Vec<Violation>) {
    let mismatch = |out: &mut Vec<Violation>| {
        out.push(Violation::Mismatch {
            key: key.to_string(),
            path: path.to_string(),
            expected: shape.to_string(),
            found: kind_of(value),
        });
    };

    match shape {
        Shape::Any => {}
        Shape::Optional(inner) => {
            if !value.is_null() {
                check_shape(key, path, value, inner, out);
            }
        }
        Shape::String if !value.is_string() => mismatch(out),
        Shape::Integer if !(value.is_i64() || value.is_u64()) => mismatch(out),
        Shape::Number if !value.is_number() => mismatch(out),
        Shape::Bool if !value.is_boolean() => mismatch(out),
        Shape::Object if !value.is_object() => mismatch(out),
        Shape::List(inner) => match value.as_array() {
            Some(items) => {
                for (idx, item) in items.iter().enumerate() {
                    check_shape(key, &format!("{path}[{idx}]"), item, inner, out);
                }
            }
            None => mismatch(out),
        },
        Shape::Map(key_shape, value_shape) => match value.as_object() {
            Some(entries) => {
                for (name, item) in entries {
                    let entry_path = format!("{path}.{name}");
                    let name_value = Value::String(name.clone());
                    check_shape(key, &entry_path, &name_value, key_shape, out);
                    check_shape(key, &entry_path, item, value_shape, out);
                }
            }
            None => mismatch(out),
        },
        _ => {}
    }
}

/// Observed kind of a JSON value, as reported in violations.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn requirement() -> ContextRequirement {
        ContextRequirement::new()
            .prompt("task_description", Shape::String)
            .prompt("acceptance_criteria", Shape::list(Shape::String))
            .prompt("previous_issues", Shape::optional(Shape::String))
            .tool("clone_path", Shape::String)
    }

    #[test]
    fn satisfied_contract_passes() {
        let ctx = Context::from_seeds([
            ("task_description", json!("add a flag")),
            ("acceptance_criteria", json!(["tests pass"])),
            ("clone_path", json!("/tmp/repo")),
        ]);
        assert_eq!(validate_context(&ctx, &requirement()), Ok(()));
    }

    #[test]
    fn reports_every_violation_not_just_the_first() {
        let ctx = Context::from_seeds([("acceptance_criteria", json!("tests pass"))]);
        let violations = validate_context(&ctx, &requirement()).unwrap_err();
        let keys: Vec<&str> = violations.iter().map(Violation::key).collect();
        assert_eq!(
            keys,
            vec!["task_description", "acceptance_criteria", "clone_path"]
        );
        assert!(matches!(violations[1], Violation::Mismatch { found: "string", .. }));
    }

    #[test]
    fn optional_accepts_absent_and_null_but_checks_present_values() {
        let mut ctx = Context::from_seeds([
            ("task_description", json!("x")),
            ("acceptance_criteria", json!([])),
            ("clone_path", json!("/tmp")),
            ("previous_issues", Value::Null),
        ]);
        assert!(validate_context(&ctx, &requirement()).is_ok());

        ctx.insert("previous_issues", json!(["not", "a", "string"]));
        let violations = validate_context(&ctx, &requirement()).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].key(), "previous_issues");
    }

    #[test]
    fn list_elements_are_checked_with_their_index() {
        let ctx = Context::from_seeds([
            ("task_description", json!("x")),
            ("acceptance_criteria", json!(["ok", 7, "fine", false])),
            ("clone_path", json!("/tmp")),
        ]);
        let violations = validate_context(&ctx, &requirement()).unwrap_err();
        let rendered: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "'acceptance_criteria[1]': expected string, found integer",
                "'acceptance_criteria[3]': expected string, found bool",
            ]
        );
    }

    #[test]
    fn map_checks_keys_and_values() {
        let req = ContextRequirement::new().prompt(
            "labels",
            Shape::map(Shape::String, Shape::list(Shape::Integer)),
        );
        let ok = Context::from_seeds([("labels", json!({"bug": [1, 2], "docs": []}))]);
        assert!(validate_context(&ok, &req).is_ok());

        let bad = Context::from_seeds([("labels", json!({"bug": [1, "two"]}))]);
        let violations = validate_context(&bad, &req).unwrap_err();
        assert_eq!(
            violations[0].to_string(),
            "'labels.bug[1]': expected integer, found string"
        );
    }

    #[test]
    fn integer_satisfies_number_but_float_does_not_satisfy_integer() {
        let req = ContextRequirement::new()
            .prompt("n", Shape::Number)
            .prompt("i", Shape::Integer);
        let ctx = Context::from_seeds([("n", json!(3)), ("i", json!(1.5))]);
        let violations = validate_context(&ctx, &req).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].key(), "i");
    }

    #[test]
    fn contract_error_echoes_requirement() {
        let err = ContractError {
            phase: "implementation".to_string(),
            violations: vec![Violation::Missing {
                key: "clone_path".to_string(),
                expected: "string".to_string(),
            }],
            requirement: requirement(),
        };
        let msg = err.to_string();
        assert!(msg.contains("phase 'implementation'"));
        assert!(msg.contains("missing key 'clone_path' (expected string)"));
        assert!(msg.contains("acceptance_criteria: list<string>"));
        assert!(msg.contains("previous_issues: optional<string>"));
        assert!(msg.contains("tools:\n    clone_path: string"));
    }
}
