//! Tool abstraction, registry, per-turn selection and execution.

pub mod config;
pub mod executor;
pub mod file;
pub mod registry;
pub mod selector;
pub mod shell;
pub mod tool;

pub use config::{SelectorConfig, ShellConfig, ToolsConfig};
pub use executor::{
    ToolError, ToolExecutor, ToolResult, deserialize_params, parse_arguments, sanitize_tool_name,
    truncate_tool_output,
};
pub use file::{ReadFileTool, WriteFileTool};
pub use registry::ToolRegistry;
pub use selector::ToolSelector;
pub use shell::ShellTool;
pub use tool::{Tool, ToolFuture, Typed, TypedTool};
