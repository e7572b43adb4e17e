use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::registry::ToolRegistry;

pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 8000;
pub const TRUNCATION_MARKER: &str = "(truncated)";

/// Errors that can occur during tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid tool parameters: {message}")]
    InvalidParams { message: String },

    #[error("unknown tool `{name}`. Available tools: {available}")]
    UnknownTool { name: String, available: String },

    #[error("command blocked by policy: {command}")]
    Blocked { command: String },

    #[error("command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("tool `{name}` is built in and cannot be replaced")]
    Shadowed { name: String },

    #[error("tool panicked: {0}")]
    Panicked(String),

    #[error("execution failed: {0}")]
    Execution(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// Deserialize tool call arguments into a typed struct.
///
/// # Errors
///
/// Returns `ToolError::InvalidParams` when deserialization fails.
pub fn deserialize_params<T: serde::de::DeserializeOwned>(
    params: &Map<String, Value>,
) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| ToolError::InvalidParams {
        message: e.to_string(),
    })
}

/// Cut a model-supplied tool name at the first stray marker character. Models sometimes
/// echo internal channel syntax (`shell<|channel|>commentary`) as part of the name.
#[must_use]
pub fn sanitize_tool_name(name: &str) -> &str {
    let name = name.trim();
    let end = name
        .find(|c: char| matches!(c, '<' | '|' | '{' | '(' | '[') || c.is_whitespace())
        .unwrap_or(name.len());
    &name[..end]
}

/// Parse raw argument text. Empty input is `{}`; a JSON string holding an object is
/// unwrapped once.
///
/// # Errors
///
/// Returns `ToolError::InvalidParams` when the text is not a JSON object.
pub fn parse_arguments(raw: &str) -> Result<Map<String, Value>, ToolError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| ToolError::InvalidParams {
        message: format!("arguments are not valid JSON: {e}"),
    })?;
    let value = match value {
        Value::String(inner) if inner.trim().is_empty() => return Ok(Map::new()),
        Value::String(inner) => {
            serde_json::from_str(&inner).map_err(|e| ToolError::InvalidParams {
                message: format!("arguments are not valid JSON: {e}"),
            })?
        }
        other => other,
    };
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ToolError::InvalidParams {
            message: format!("arguments must be a JSON object, got {other}"),
        }),
    }
}

/// Cap output at `max_chars` characters, appending a truncation marker.
#[must_use]
pub fn truncate_tool_output(output: &str, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        None => output.to_owned(),
        Some((cut, _)) => format!("{}\n... {TRUNCATION_MARKER}", &output[..cut]),
    }
}

/// Outcome of one invocation. `output` is always model-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub name: String,
    pub output: String,
    pub is_error: bool,
}

/// Dispatches name + argument text to registered tools.
///
/// Every failure (bad arguments, unknown tool, handler error, handler panic) comes back
/// as an `Error: ...` result so the agent loop can continue.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    max_output_chars: usize,
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("tools", &self.registry.names())
            .field("max_output_chars", &self.max_output_chars)
            .finish()
    }
}

impl ToolExecutor {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }

    #[must_use]
    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn execute(&self, name: &str, raw_args: &str) -> ToolResult {
        let clean = sanitize_tool_name(name);
        if clean != name {
            tracing::debug!(raw = name, clean, "sanitized tool name");
        }
        let span = tracing::info_span!("tool_exec", tool_name = clean);
        let result = self.dispatch(clean, raw_args).instrument(span).await;
        let (output, is_error) = match result {
            Ok(text) => (text, false),
            Err(e) => {
                tracing::warn!(tool = clean, "tool failed: {e}");
                (format!("Error: {e}"), true)
            }
        };
        ToolResult {
            name: clean.to_owned(),
            output: truncate_tool_output(&output, self.max_output_chars),
            is_error,
        }
    }

    async fn dispatch(&self, name: &str, raw_args: &str) -> Result<String, ToolError> {
        let Some(tool) = self.registry.get(name) else {
            return Err(ToolError::UnknownTool {
                name: name.to_owned(),
                available: self.registry.names().join(", "),
            });
        };
        let args = parse_arguments(raw_args)?;
        match AssertUnwindSafe(tool.execute(&args)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!(tool = name, "tool panicked: {msg}");
                Err(ToolError::Panicked(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use schemars::JsonSchema;
    use serde::Deserialize;

    use super::*;
    use crate::tool::{Typed, TypedTool};

    #[derive(Deserialize, JsonSchema)]
    struct CountParams {
        n: u32,
    }

    struct Count;

    impl TypedTool for Count {
        type Params = CountParams;

        fn name(&self) -> &str {
            "count"
        }

        fn description(&self) -> &str {
            "Emit n characters"
        }

        async fn run(&self, params: CountParams) -> Result<String, ToolError> {
            Ok("x".repeat(params.n as usize))
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct Empty {}

    struct Boom;

    impl TypedTool for Boom {
        type Params = Empty;

        fn name(&self) -> &str {
            "boom"
        }

        fn description(&self) -> &str {
            "Always panics"
        }

        async fn run(&self, _params: Empty) -> Result<String, ToolError> {
            panic!("handler exploded")
        }
    }

    fn executor_with_cap(max_output_chars: usize) -> ToolExecutor {
        let registry = ToolRegistry::new()
            .with_builtin(Arc::new(Typed(Count)))
            .with_builtin(Arc::new(Typed(Boom)));
        ToolExecutor::new(Arc::new(registry)).with_max_output_chars(max_output_chars)
    }

    fn executor() -> ToolExecutor {
        executor_with_cap(10)
    }

    fn roomy_executor() -> ToolExecutor {
        executor_with_cap(1_000)
    }

    #[test]
    fn sanitize_strips_channel_suffix() {
        assert_eq!(sanitize_tool_name("shell<|channel|>commentary"), "shell");
        assert_eq!(sanitize_tool_name(" read_file "), "read_file");
        assert_eq!(sanitize_tool_name("write_file{\"path\":1}"), "write_file");
        assert_eq!(sanitize_tool_name("evolve (patch)"), "evolve");
        assert_eq!(sanitize_tool_name("plain"), "plain");
    }

    #[test]
    fn parse_arguments_shapes() {
        assert!(parse_arguments("").unwrap().is_empty());
        assert!(parse_arguments("null").unwrap().is_empty());
        assert_eq!(parse_arguments(r#"{"a":1}"#).unwrap()["a"], 1);
        assert_eq!(parse_arguments(r#""{\"a\":2}""#).unwrap()["a"], 2);
        assert!(parse_arguments("[1,2]").is_err());
        assert!(parse_arguments("{oops").is_err());
    }

    #[test]
    fn truncate_keeps_short_output() {
        assert_eq!(truncate_tool_output("abc", 10), "abc");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate_tool_output("ééééé", 2);
        assert!(out.starts_with("éé\n"));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn executes_and_truncates() {
        let result = executor().execute("count", r#"{"n": 50}"#).await;
        assert!(!result.is_error);
        assert!(result.output.starts_with("xxxxxxxxxx\n"));
        assert!(result.output.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn decorated_name_is_dispatched() {
        let result = executor().execute("count<|constrain|>json", r#"{"n": 2}"#).await;
        assert_eq!(result.name, "count");
        assert_eq!(result.output, "xx");
    }

    #[tokio::test]
    async fn unknown_tool_lists_available() {
        let result = roomy_executor().execute("nope", "{}").await;
        assert!(result.is_error);
        assert!(result.output.starts_with("Error: unknown tool `nope`"));
        assert!(result.output.contains("count"));
    }

    #[tokio::test]
    async fn missing_argument_is_error_result() {
        let result = roomy_executor().execute("count", "{}").await;
        assert!(result.is_error);
        assert!(result.output.contains("missing field `n`"));
    }

    #[tokio::test]
    async fn panic_is_recovered() {
        let result = roomy_executor().execute("boom", "").await;
        assert!(result.is_error);
        assert!(result.output.contains("handler exploded"));
    }

    #[tokio::test]
    async fn error_text_is_truncated_like_output() {
        let result = executor().execute("nope", "{}").await;
        assert!(result.is_error);
        assert!(result.output.starts_with("Error: unk\n"));
        assert!(result.output.ends_with(TRUNCATION_MARKER));
    }

    proptest! {
        #[test]
        fn truncation_is_bounded(s in "\\PC{0,200}", max in 0usize..64) {
            let out = truncate_tool_output(&s, max);
            let bound = max + "\n... ".len() + TRUNCATION_MARKER.len();
            prop_assert!(out.chars().count() <= bound);
            if s.chars().count() <= max {
                prop_assert_eq!(out, s);
            }
        }
    }
}
