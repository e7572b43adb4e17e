use std::future::Future;
use std::pin::Pin;

use ember_llm::ToolDefinition;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::executor::{ToolError, deserialize_params};

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

/// Object-safe tool interface stored in the registry.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn definition(&self) -> ToolDefinition;

    fn execute<'a>(&'a self, args: &'a Map<String, Value>) -> ToolFuture<'a>;
}

/// Tool with a typed parameter struct. Wrap in [`Typed`] to register it.
///
/// The JSON schema advertised to the model is derived from `Params`, and arguments are
/// bound through it, so a missing or mistyped field becomes `ToolError::InvalidParams`
/// before `run` is ever called.
pub trait TypedTool: Send + Sync + 'static {
    type Params: DeserializeOwned + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn run(&self, params: Self::Params) -> impl Future<Output = Result<String, ToolError>> + Send;
}

#[derive(Debug)]
pub struct Typed<T>(pub T);

impl<T: TypedTool> Tool for Typed<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn definition(&self) -> ToolDefinition {
        let mut parameters =
            serde_json::to_value(schemars::schema_for!(T::Params)).unwrap_or_default();
        if let Value::Object(ref mut map) = parameters {
            map.remove("$schema");
            map.remove("title");
        }
        ToolDefinition {
            name: self.0.name().to_owned(),
            description: self.0.description().to_owned(),
            parameters,
        }
    }

    fn execute<'a>(&'a self, args: &'a Map<String, Value>) -> ToolFuture<'a> {
        Box::pin(async move {
            let params = deserialize_params::<T::Params>(args)?;
            self.0.run(params).await
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize, JsonSchema)]
    struct EchoParams {
        /// Text to echo back
        text: String,
        #[serde(default)]
        times: Option<u32>,
    }

    struct Echo;

    impl TypedTool for Echo {
        type Params = EchoParams;

        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo text"
        }

        async fn run(&self, params: EchoParams) -> Result<String, ToolError> {
            Ok(params.text.repeat(params.times.unwrap_or(1) as usize))
        }
    }

    #[test]
    fn definition_strips_schema_and_title() {
        let def = Typed(Echo).definition();
        assert_eq!(def.name, "echo");
        let obj = def.parameters.as_object().unwrap();
        assert!(!obj.contains_key("$schema"));
        assert!(!obj.contains_key("title"));
        assert!(obj["properties"].get("text").is_some());
        assert_eq!(obj["required"], serde_json::json!(["text"]));
    }

    #[tokio::test]
    async fn execute_binds_typed_params_with_defaults() {
        let tool = Typed(Echo);
        let args = serde_json::json!({"text": "ab"});
        let out = tool.execute(args.as_object().unwrap()).await.unwrap();
        assert_eq!(out, "ab");
    }

    #[tokio::test]
    async fn execute_reports_mistyped_field() {
        let tool = Typed(Echo);
        let args = serde_json::json!({"text": 5});
        let err = tool.execute(args.as_object().unwrap()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }
}
