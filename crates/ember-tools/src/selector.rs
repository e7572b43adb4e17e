use std::collections::HashSet;

use ember_llm::{Message, Role, ToolDefinition};

use crate::config::SelectorConfig;

/// Narrows the full catalog to the schemas worth advertising this turn. Small local
/// models degrade when shown more than about ten tools.
///
/// A tool is included when it is in the core set, when one of its trigger keywords
/// appears in the last few user messages, or when the thread already invoked it.
#[derive(Debug, Clone)]
pub struct ToolSelector {
    core: Vec<String>,
    lookback: usize,
    keywords: Vec<(String, Vec<String>)>,
}

impl Default for ToolSelector {
    fn default() -> Self {
        Self::new(&SelectorConfig::default())
    }
}

impl ToolSelector {
    #[must_use]
    pub fn new(config: &SelectorConfig) -> Self {
        Self {
            core: config.core.clone(),
            lookback: config.lookback,
            keywords: config
                .keywords
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn select(&self, catalog: &[ToolDefinition], messages: &[Message]) -> Vec<ToolDefinition> {
        let wanted = self.wanted(messages);
        catalog
            .iter()
            .filter(|t| wanted.contains(t.name.as_str()))
            .cloned()
            .collect()
    }

    fn wanted<'a>(&'a self, messages: &'a [Message]) -> HashSet<&'a str> {
        let mut wanted: HashSet<&str> = self.core.iter().map(String::as_str).collect();

        let recent: Vec<String> = messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .take(self.lookback)
            .map(|m| m.content.to_lowercase())
            .collect();
        for (keyword, tools) in &self.keywords {
            if recent.iter().any(|text| text.contains(keyword.as_str())) {
                wanted.extend(tools.iter().map(String::as_str));
            }
        }

        for m in messages {
            wanted.extend(m.tool_calls.iter().map(|c| c.name.as_str()));
        }
        wanted
    }
}
