//! Turn a raw terminal tool result into a [`PhaseResult`].
//!
//! Expected payload: a JSON object with a boolean `success`, an optional
//! `data` object, and, when unsuccessful, a `message` or `error` string.
//! Agents often wrap JSON in a fenced code block; the fence is stripped first.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::types::PhaseResult;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n(.*?)\n?\s*```\s*$").expect("static regex")
});

/// Parse a terminal tool result. Never fails; malformed input yields a
/// failed result whose error starts with `failed to parse response`.
pub fn parse_phase_result(raw: &str) -> PhaseResult {
    match parse_envelope(raw) {
        Ok(result) => result,
        Err(cause) => PhaseResult::failed(format!("failed to parse response: {cause}")),
    }
}

fn parse_envelope(raw: &str) -> Result<PhaseResult, String> {
    let body = strip_fence(raw);
    let value: Value = serde_json::from_str(body).map_err(|err| err.to_string())?;
    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return Err(format!(
                "expected an object, found {}",
                crate::core::contract::kind_of(&other)
            ));
        }
    };

    let success = object
        .get("success")
        .and_then(Value::as_bool)
        .ok_or_else(|| "missing boolean field 'success'".to_string())?;

    let data = match object.remove("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(data)) => data,
        Some(other) => {
            return Err(format!(
                "field 'data' must be an object, found {}",
                crate::core::contract::kind_of(&other)
            ));
        }
    };

    if success {
        return Ok(PhaseResult::ok(data));
    }

    let message = ["message", "error"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .filter(|msg| !msg.trim().is_empty())
        .unwrap_or("phase reported failure without a message");
    Ok(PhaseResult {
        success: false,
        data,
        error: Some(message.to_string()),
    })
}

fn strip_fence(raw: &str) -> &str {
    match FENCED_BLOCK.captures(raw).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str(),
        None => raw.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_success_keeps_data() {
        let result = parse_phase_result(r#"{"success": true, "data": {"x": 1}}"#);
        assert!(result.success);
        assert_eq!(Value::Object(result.data), json!({"x": 1}));
        assert_eq!(result.error, None);
    }

    #[test]
    fn missing_data_defaults_to_empty() {
        let result = parse_phase_result(r#"{"success": true}"#);
        assert!(result.success);
        assert!(result.data.is_empty());
    }

    #[test]
    fn unparsable_input_is_a_failed_result() {
        let result = parse_phase_result("I think the change is done!");
        assert!(!result.success);
        assert!(result.error_message().contains("failed to parse"));
    }

    #[test]
    fn failure_surfaces_message_then_error() {
        let with_message =
            parse_phase_result(r#"{"success": false, "message": "push rejected", "error": "x"}"#);
        assert_eq!(with_message.error.as_deref(), Some("push rejected"));

        let with_error = parse_phase_result(r#"{"success": false, "error": "quota"}"#);
        assert_eq!(with_error.error.as_deref(), Some("quota"));

        let bare = parse_phase_result(r#"{"success": false}"#);
        assert_eq!(
            bare.error.as_deref(),
            Some("phase reported failure without a message")
        );
    }

    #[test]
    fn success_never_carries_an_error() {
        let result = parse_phase_result(r#"{"success": true, "error": "ignored"}"#);
        assert!(result.success);
        assert_eq!(result.error, None);
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"success\": true, \"data\": {\"url\": \"https://x/pr/1\"}}\n```";
        let result = parse_phase_result(raw);
        assert!(result.success);
        assert_eq!(result.data_str("url"), Some("https://x/pr/1"));
    }

    #[test]
    fn structural_errors_are_parse_failures() {
        for raw in [
            "[1, 2]",
            r#"{"data": {}}"#,
            r#"{"success": "yes"}"#,
            r#"{"success": true, "data": [1]}"#,
        ] {
            let result = parse_phase_result(raw);
            assert!(!result.success, "{raw}");
            assert!(
                result.error_message().starts_with("failed to parse response"),
                "{raw}: {}",
                result.error_message()
            );
        }
    }
}
