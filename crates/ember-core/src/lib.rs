//! Agent loop, context compaction, self-state kernel and self-evolution pipeline.

pub mod agent;
pub mod compaction;
pub mod config;
pub mod context;
pub mod evolution;
pub mod reflection;
pub mod self_state;
pub mod tools;

pub use agent::{
    Agent, AgentError, AgentEvent, AgentEventTx, AgentSettings, TurnOutcome, TurnRequest,
    TurnStatus,
};
pub use compaction::{CompactionMode, CompactionState, ContextCompressor};
pub use config::Config;
pub use evolution::{EvolveError, EvolvePipeline};
pub use self_state::{KernelError, SelfState, SelfStateKernel};
pub use tools::{EvolveTool, SelfStateTool};
