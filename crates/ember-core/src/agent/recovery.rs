//! Tool invocations written into reply text instead of the structured field.

use std::sync::LazyLock;

use ember_llm::ToolCall;
use ember_tools::sanitize_tool_name;
use regex::Regex;
use serde_json::Value;

static TAGGED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").expect("valid regex")
});

static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"));

/// Find a call to one of `known` tools in free text: a `<tool_call>` block, a fenced
/// JSON block, or a bare JSON object with `name` and `arguments` (or `parameters`).
#[must_use]
pub fn recover_tool_call(text: &str, known: &[String]) -> Option<ToolCall> {
    let candidates = TAGGED
        .captures_iter(text)
        .chain(FENCED.captures_iter(text))
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .chain(bare_object(text));

    candidates
        .filter_map(|raw| serde_json::from_str::<Value>(raw).ok())
        .find_map(|value| to_call(&value, known))
}

fn bare_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn to_call(value: &Value, known: &[String]) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let name = sanitize_tool_name(obj.get("name")?.as_str()?);
    if !known.iter().any(|k| k == name) {
        return None;
    }
    let arguments = match obj.get("arguments").or_else(|| obj.get("parameters")) {
        None | Some(Value::Null) => "{}".to_owned(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let id = uuid::Uuid::new_v4().simple().to_string();
    Some(ToolCall {
        id: format!("recovered_{}", &id[..8]),
        name: name.to_owned(),
        arguments,
    })
}
