use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::executor::DEFAULT_MAX_OUTPUT_CHARS;

fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}

fn default_timeout() -> u64 {
    60
}

fn default_lookback() -> usize {
    3
}

fn default_core() -> Vec<String> {
    ["shell", "read_file", "write_file", "self_state"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_keywords() -> BTreeMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        ("run", &["shell"]),
        ("command", &["shell"]),
        ("install", &["shell"]),
        ("git", &["shell"]),
        ("file", &["read_file", "write_file"]),
        ("read", &["read_file"]),
        ("write", &["write_file"]),
        ("save", &["write_file"]),
        ("prompt", &["self_state"]),
        ("rule", &["self_state"]),
        ("rollback", &["self_state"]),
        ("benchmark", &["self_state"]),
        ("evolve", &["evolve"]),
        ("patch", &["evolve"]),
        ("source code", &["evolve"]),
        ("rebuild", &["evolve"]),
        ("upgrade yourself", &["evolve"]),
        ("search", &["web_search", "doc_search"]),
        ("look up", &["web_search"]),
        ("http", &["web_fetch"]),
        ("url", &["web_fetch"]),
        ("fetch", &["web_fetch"]),
        ("diagram", &["diagram"]),
        ("chart", &["diagram"]),
        ("sandbox", &["sandbox_exec"]),
        ("container", &["sandbox_exec"]),
        ("document", &["doc_search"]),
    ];
    table
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.iter().map(|s| (*s).to_owned()).collect()))
        .collect()
}

/// Top-level configuration for tool execution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_output_chars: default_max_output_chars(),
            shell: ShellConfig::default(),
            selector: SelectorConfig::default(),
        }
    }
}

/// Shell tool: timeout in seconds and substring blocklist.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            blocked_commands: Vec::new(),
        }
    }
}

/// Per-turn tool narrowing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectorConfig {
    /// Always advertised.
    #[serde(default = "default_core")]
    pub core: Vec<String>,
    /// Number of most recent user messages scanned for keywords.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    /// Case-insensitive keyword to tool names.
    #[serde(default = "default_keywords")]
    pub keywords: BTreeMap<String, Vec<String>>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            core: default_core(),
            lookback: default_lookback(),
            keywords: default_keywords(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg: ToolsConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.max_output_chars, 8000);
        assert_eq!(cfg.shell.timeout, 60);
        assert_eq!(cfg.selector.lookback, 3);
        assert_eq!(cfg.selector.core, ["shell", "read_file", "write_file", "self_state"]);
        assert_eq!(cfg.selector.keywords["patch"], ["evolve"]);
    }

    #[test]
    fn keyword_table_is_overridable() {
        let cfg: ToolsConfig = toml::from_str(
            r#"
            max_output_chars = 500

            [shell]
            blocked_commands = ["rm -rf /"]

            [selector]
            core = ["shell"]
            keywords = { weather = ["forecast"] }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_output_chars, 500);
        assert_eq!(cfg.shell.blocked_commands, ["rm -rf /"]);
        assert_eq!(cfg.selector.core, ["shell"]);
        assert_eq!(cfg.selector.keywords.len(), 1);
        assert_eq!(cfg.selector.lookback, 3);
    }
}
