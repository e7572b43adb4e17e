//! Message model, provider abstraction and the OpenAI-compatible backend.

pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod openai;
pub mod provider;
mod retry;
pub mod sse;

pub use error::LlmError;
pub use provider::{
    Attachment, ChatOptions, ChatResponse, DeltaTx, LlmProvider, Message, Role, StreamDelta,
    ToolCall, ToolChoice, ToolDefinition,
};
