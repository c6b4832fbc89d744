use async_openai::types::CreateChatCompletionResponse;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::AppError;

/// Pulls the assistant text out of a chat completion.
///
/// A response without a first choice or without message content is an
/// invocation-level failure, not a parsing one: the model never answered.
pub fn response_text(response: CreateChatCompletionResponse) -> Result<String, AppError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| AppError::InvocationFailure("model returned no message content".into()))
}

/// Strict boundary parse: the text must be a single JSON object, nothing else.
/// Arrays, scalars, and prose-wrapped payloads are all rejected the same way.
pub fn parse_json_object(text: &str) -> Result<Map<String, Value>, AppError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| AppError::MalformedOutput(format!("not valid JSON: {err}")))?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(AppError::MalformedOutput(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Parses the text into a typed record, mapping failures to `MalformedOutput`.
pub fn parse_typed<T: DeserializeOwned>(text: &str) -> Result<T, AppError> {
    serde_json::from_str(text).map_err(|err| AppError::MalformedOutput(err.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_payload_parses() {
        let map = parse_json_object(r#"{"summary": "short"}"#).expect("parse");
        assert_eq!(map.get("summary").and_then(Value::as_str), Some("short"));
    }

    #[test]
    fn prose_payload_is_malformed() {
        let err = parse_json_object("Here is the summary you asked for.")
            .expect_err("prose must not parse");
        assert!(matches!(err, AppError::MalformedOutput(_)));
    }

    #[test]
    fn non_object_json_is_malformed() {
        let err = parse_json_object(r#"["a", "b"]"#).expect_err("array must not parse");
        assert!(matches!(err, AppError::MalformedOutput(_)));
        let err = parse_json_object("42").expect_err("scalar must not parse");
        assert!(matches!(err, AppError::MalformedOutput(_)));
    }
}
