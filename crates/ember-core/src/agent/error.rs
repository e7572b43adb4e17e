#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] ember_llm::LlmError),

    #[error(transparent)]
    Memory(#[from] ember_memory::MemoryError),

    #[error(transparent)]
    Kernel(#[from] crate::self_state::KernelError),

    #[error(transparent)]
    Tool(#[from] ember_tools::ToolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
