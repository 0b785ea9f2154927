//! Interpretation of validation phase data.

use serde_json::{Map, Value};

pub const UNKNOWN_FAILURE: &str = "Validation failed for unknown reason.";

/// Outcome of one validation phase, read from its result data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub validated: bool,
    /// Acceptance criteria the validator reported as unmet.
    pub not_met: Vec<String>,
    pub notes: Option<String>,
}

impl ValidationVerdict {
    /// Read `validated`, `not_met` and `notes` from validation data.
    ///
    /// A missing or non-boolean `validated` flag counts as not validated.
    pub fn from_data(data: &Map<String, Value>) -> Self {
        let validated = data
            .get("validated")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let not_met = data
            .get("not_met")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let notes = data
            .get("notes")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            validated,
            not_met,
            notes,
        }
    }

    /// Human-readable description of why validation failed, fed to the next
    /// fix attempt.
    pub fn previous_issues(&self) -> String {
        let mut buf = if self.not_met.is_empty() {
            UNKNOWN_FAILURE.to_string()
        } else {
            let mut buf = String::from("Validation failed. These acceptance criteria are not met:");
            for item in &self.not_met {
                buf.push_str("\n- ");
                buf.push_str(item);
            }
            buf
        };
        if let Some(notes) = &self.notes {
            buf.push_str("\n\nValidator notes: ");
            buf.push_str(notes);
        }
        buf
    }
}

/// `previous_issues` text recorded when the validation phase itself failed.
pub fn validation_unavailable(error: &str) -> String {
    format!("Validation could not be completed: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn validated_flag_is_read() {
        let verdict = ValidationVerdict::from_data(&data(json!({"validated": true})));
        assert!(verdict.validated);
    }

    #[test]
    fn missing_flag_is_not_validated() {
        let verdict = ValidationVerdict::from_data(&data(json!({"validated": "yes"})));
        assert!(!verdict.validated);
        assert_eq!(verdict.previous_issues(), UNKNOWN_FAILURE);
    }

    #[test]
    fn not_met_list_is_joined() {
        let verdict = ValidationVerdict::from_data(&data(json!({
            "validated": false,
            "not_met": ["docs updated", " ", "tests cover the flag", 4],
        })));
        assert_eq!(
            verdict.previous_issues(),
            "Validation failed. These acceptance criteria are not met:\n- docs updated\n- tests cover the flag"
        );
    }

    #[test]
    fn notes_are_appended() {
        let verdict = ValidationVerdict::from_data(&data(json!({
            "validated": false,
            "notes": "flag is parsed but unused",
        })));
        let issues = verdict.previous_issues();
        assert!(issues.starts_with(UNKNOWN_FAILURE));
        assert!(issues.ends_with("Validator notes: flag is parsed but unused"));
    }
}
