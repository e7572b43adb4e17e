//! Self-State Kernel: the agent's versioned prompt, parameters and rules.

pub mod benchmark;
mod kernel;
pub mod store;
pub mod types;
pub mod validate;

pub use benchmark::{BenchmarkReport, Category, Scorer};
pub use kernel::SelfStateKernel;
pub use types::{FACTORY_PROMPT, Params, Rule, SelfState, SnapshotMeta, Verbosity};
pub use validate::ValidationError;

use ember_memory::MemoryError;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("unknown parameter {0:?}")]
    UnknownParam(String),

    #[error("invalid value {value:?} for {param}: {reason}")]
    InvalidValue {
        param: String,
        value: String,
        reason: String,
    },

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("no snapshot holds version {0}")]
    SnapshotNotFound(u64),

    #[error("already at version {0}")]
    AlreadyCurrent(u64),

    #[error("version {target} is newer than the current version {current}")]
    FutureVersion { target: u64, current: u64 },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
