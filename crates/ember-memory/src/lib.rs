//! Persistence for ember: per-thread message logs and the playbook of learned lessons.

pub mod error;
pub mod jsonl;
pub mod playbook;
pub mod store;
pub mod types;

pub use error::MemoryError;
pub use playbook::{Bullet, BulletKind, NewBullet, Playbook, PlaybookLimits};
pub use store::{SUMMARY_PREFIX, SearchHit, ThreadStore};
pub use types::{ThreadId, ThreadMeta};

/// Estimate token count using chars/4 heuristic.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}
