use std::sync::{Arc, PoisonError, RwLock};

use ember_llm::ToolDefinition;

use crate::executor::ToolError;
use crate::tool::Tool;

/// Fixed builtin tools plus runtime-installed extensions.
///
/// Extensions sit behind one read/write lock: lookups and catalog listing share it,
/// install/remove take it exclusively. Builtin names cannot be shadowed.
#[derive(Default)]
pub struct ToolRegistry {
    builtins: Vec<Arc<dyn Tool>>,
    extensions: RwLock<Vec<Arc<dyn Tool>>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a builtin. A later builtin with the same name replaces the earlier one.
    #[must_use]
    pub fn with_builtin(mut self, tool: Arc<dyn Tool>) -> Self {
        self.builtins.retain(|t| t.name() != tool.name());
        self.builtins.push(tool);
        self
    }

    fn is_builtin(&self, name: &str) -> bool {
        self.builtins.iter().any(|t| t.name() == name)
    }

    /// Install or replace an extension tool.
    ///
    /// # Errors
    ///
    /// Returns `ToolError::Shadowed` if the name belongs to a builtin.
    pub fn install(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_owned();
        if self.is_builtin(&name) {
            return Err(ToolError::Shadowed { name });
        }
        let mut ext = self
            .extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        ext.retain(|t| t.name() != name);
        ext.push(tool);
        tracing::info!(tool = %name, "extension installed");
        Ok(())
    }

    /// Returns whether an extension with that name existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut ext = self
            .extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = ext.len();
        ext.retain(|t| t.name() != name);
        before != ext.len()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(t) = self.builtins.iter().find(|t| t.name() == name) {
            return Some(Arc::clone(t));
        }
        self.extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Catalog order: builtins in registration order, then extensions in install order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let ext = self
            .extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.builtins
            .iter()
            .chain(ext.iter())
            .map(|t| t.name().to_owned())
            .collect()
    }

    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let ext = self
            .extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.builtins
            .iter()
            .chain(ext.iter())
            .map(|t| t.definition())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};

    use super::*;
    use crate::tool::ToolFuture;

    struct Fixed(&'static str, &'static str);

    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.0.into(),
                description: self.1.into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        fn execute<'a>(&'a self, _args: &'a Map<String, Value>) -> ToolFuture<'a> {
            Box::pin(async move { Ok(self.1.to_owned()) })
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with_builtin(Arc::new(Fixed("shell", "builtin shell")))
            .with_builtin(Arc::new(Fixed("read_file", "builtin read")))
    }

    #[test]
    fn extension_cannot_shadow_builtin() {
        let reg = registry();
        let err = reg.install(Arc::new(Fixed("shell", "evil"))).unwrap_err();
        assert!(matches!(err, ToolError::Shadowed { .. }));
        assert_eq!(reg.get("shell").unwrap().definition().description, "builtin shell");
    }

    #[test]
    fn install_replaces_same_named_extension() {
        let reg = registry();
        reg.install(Arc::new(Fixed("weather", "v1"))).unwrap();
        reg.install(Arc::new(Fixed("weather", "v2"))).unwrap();
        assert_eq!(reg.names(), ["shell", "read_file", "weather"]);
        assert_eq!(reg.get("weather").unwrap().definition().description, "v2");
    }

    #[test]
    fn remove_extension() {
        let reg = registry();
        reg.install(Arc::new(Fixed("weather", "v1"))).unwrap();
        assert!(reg.remove("weather"));
        assert!(!reg.remove("weather"));
        assert!(!reg.remove("shell"));
        assert!(!reg.contains("weather"));
    }

    #[test]
    fn definitions_follow_catalog_order() {
        let reg = registry();
        reg.install(Arc::new(Fixed("zeta", "z"))).unwrap();
        let names: Vec<String> = reg.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["shell", "read_file", "zeta"]);
    }
}
