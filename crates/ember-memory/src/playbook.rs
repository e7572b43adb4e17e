//! Accumulated lessons extracted by reflection, injected into the system prompt.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::jsonl;

/// Token overlap above which a new bullet is merged into an existing one.
pub const MERGE_OVERLAP: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulletKind {
    Strategy,
    Pitfall,
    ToolPattern,
    Preference,
}

impl BulletKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "strategy" => Some(Self::Strategy),
            "pitfall" => Some(Self::Pitfall),
            "tool_pattern" => Some(Self::ToolPattern),
            "preference" => Some(Self::Preference),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strategy => "strategy",
            Self::Pitfall => "pitfall",
            Self::ToolPattern => "tool_pattern",
            Self::Preference => "preference",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bullet {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BulletKind,
    pub content: String,
    pub hits: u32,
    pub misses: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Candidate produced by reflection before it is merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBullet {
    pub kind: BulletKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybookLimits {
    pub max_bullets: usize,
    pub miss_floor: u32,
}

impl Default for PlaybookLimits {
    fn default() -> Self {
        Self {
            max_bullets: 100,
            miss_floor: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub merged: usize,
    pub pruned: usize,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct Playbook {
    path: PathBuf,
    limits: PlaybookLimits,
    bullets: Vec<Bullet>,
}

impl Playbook {
    /// Load `path`, starting empty when it is missing or unreadable.
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures other than a missing file.
    pub async fn load(path: &Path, limits: PlaybookLimits) -> Result<Self, MemoryError> {
        let bullets = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "corrupt playbook, starting empty: {e}");
                Vec::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            limits,
            bullets,
        })
    }

    #[must_use]
    pub fn bullets(&self) -> &[Bullet] {
        &self.bullets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bullets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bullets.is_empty()
    }

    /// Merge candidates, then prune and cap.
    pub fn merge(&mut self, candidates: Vec<NewBullet>) -> MergeReport {
        let mut report = MergeReport::default();
        let now = Utc::now();
        for cand in candidates {
            let content = cand.content.trim();
            if content.is_empty() {
                continue;
            }
            let best = self
                .bullets
                .iter_mut()
                .map(|b| {
                    let score = overlap(&b.content, content);
                    (b, score)
                })
                .filter(|(_, score)| *score > MERGE_OVERLAP)
                .max_by(|a, b| a.1.total_cmp(&b.1));
            if let Some((existing, _)) = best {
                existing.hits += 1;
                if content.chars().count() > existing.content.chars().count() {
                    content.clone_into(&mut existing.content);
                }
                existing.updated_at = now;
                report.merged += 1;
            } else {
                self.bullets.push(Bullet {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: cand.kind,
                    content: content.to_owned(),
                    hits: 0,
                    misses: 0,
                    created_at: now,
                    updated_at: now,
                });
                report.added += 1;
            }
        }
        report.pruned = self.prune();
        report.evicted = self.cap();
        tracing::debug!(
            added = report.added,
            merged = report.merged,
            pruned = report.pruned,
            evicted = report.evicted,
            "playbook merged"
        );
        report
    }

    /// Drop bullets whose misses exceed both the floor and twice their hits.
    pub fn prune(&mut self) -> usize {
        let floor = self.limits.miss_floor;
        let before = self.bullets.len();
        self.bullets
            .retain(|b| !(b.misses > floor && b.misses > b.hits.saturating_mul(2)));
        before - self.bullets.len()
    }

    /// Evict lowest-hit bullets, oldest first on ties, down to `max_bullets`.
    pub fn cap(&mut self) -> usize {
        let excess = self.bullets.len().saturating_sub(self.limits.max_bullets);
        if excess == 0 {
            return 0;
        }
        let mut order: Vec<usize> = (0..self.bullets.len()).collect();
        order.sort_by(|&a, &b| {
            let (x, y) = (&self.bullets[a], &self.bullets[b]);
            x.hits.cmp(&y.hits).then(x.created_at.cmp(&y.created_at))
        });
        let evict: HashSet<usize> = order.into_iter().take(excess).collect();
        let mut i = 0;
        self.bullets.retain(|_| {
            let keep = !evict.contains(&i);
            i += 1;
            keep
        });
        excess
    }

    /// Highest-hit bullets, most recently updated first on ties.
    #[must_use]
    pub fn top(&self, n: usize) -> Vec<&Bullet> {
        let mut sorted: Vec<&Bullet> = self.bullets.iter().collect();
        sorted.sort_by(|a, b| b.hits.cmp(&a.hits).then(b.updated_at.cmp(&a.updated_at)));
        sorted.truncate(n);
        sorted
    }

    /// Render the top bullets as a prompt section, or `None` when empty.
    #[must_use]
    pub fn render(&self, n: usize) -> Option<String> {
        let top = self.top(n);
        if top.is_empty() {
            return None;
        }
        let mut out = String::from("## Playbook\nLessons from earlier sessions:\n");
        for b in top {
            let _ = writeln!(out, "- [{}] {}", b.kind.as_str(), b.content);
        }
        Some(out)
    }

    /// Credit (or debit) the bullets that were shown during a turn.
    pub fn record_outcome(&mut self, ids: &[String], success: bool) {
        let now = Utc::now();
        for b in self.bullets.iter_mut().filter(|b| ids.contains(&b.id)) {
            if success {
                b.hits += 1;
            } else {
                b.misses += 1;
            }
            b.updated_at = now;
        }
        self.prune();
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self) -> Result<(), MemoryError> {
        let bytes = serde_json::to_vec_pretty(&self.bullets)?;
        jsonl::write_atomic(&self.path, &bytes).await
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// `|A ∩ B| / min(|A|, |B|)` over lowercase alphanumeric tokens.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn overlap(a: &str, b: &str) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    let smaller = ta.len().min(tb.len());
    if smaller == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / smaller as f64
}

/// Extract candidates from a reflection reply: the first JSON array of
/// `{type, content}` objects found anywhere in the text. Unknown types are dropped.
#[must_use]
pub fn parse_reflection(reply: &str) -> Vec<NewBullet> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(rename = "type", default)]
        kind: String,
        #[serde(default)]
        content: String,
    }

    for (start, _) in reply.match_indices('[') {
        let mut stream =
            serde_json::Deserializer::from_str(&reply[start..]).into_iter::<Vec<serde_json::Value>>();
        if let Some(Ok(items)) = stream.next() {
            return items
                .into_iter()
                .filter_map(|v| serde_json::from_value::<Raw>(v).ok())
                .filter_map(|r| {
                    let kind = BulletKind::parse(&r.kind)?;
                    let content = r.content.trim();
                    (!content.is_empty()).then(|| NewBullet {
                        kind,
                        content: content.to_owned(),
                    })
                })
                .collect();
        }
    }
    Vec::new()
}
