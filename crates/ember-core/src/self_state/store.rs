//! On-disk layout of the self-state: current files, snapshots and benchmark history.

use std::path::{Path, PathBuf};

use chrono::Utc;
use ember_memory::jsonl;
use serde::{Deserialize, Serialize};

use super::KernelError;
use super::benchmark::BenchmarkReport;
use super::types::{Params, Rule, SelfState, SnapshotMeta};

const PROMPT_FILE: &str = "prompt.md";
const PARAMS_FILE: &str = "params.json";
const RULES_FILE: &str = "rules.jsonl";
const META_FILE: &str = "meta.json";
const SNAPSHOT_DIR: &str = "snapshots";
const BENCHMARK_FILE: &str = "benchmarks.jsonl";

#[derive(Serialize, Deserialize)]
struct ParamsRecord {
    version: u64,
    #[serde(default)]
    benchmark_score: Option<f64>,
    #[serde(default)]
    params: Params,
}

#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    max_snapshots: usize,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: PathBuf, max_snapshots: usize) -> Self {
        Self { dir, max_snapshots }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current state, or `None` on a fresh install.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub async fn load(&self) -> Result<Option<SelfState>, KernelError> {
        read_state(&self.dir).await
    }

    /// Overwrite the current files. `params.json` goes last since it carries the version.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub async fn save(&self, state: &SelfState) -> Result<(), KernelError> {
        write_state(&self.dir, state).await
    }

    /// Copy `state` into a new timestamped snapshot directory, then apply retention.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub async fn snapshot(&self, state: &SelfState, reason: &str) -> Result<SnapshotMeta, KernelError> {
        let meta = SnapshotMeta {
            version: state.version,
            reason: reason.to_owned(),
            score: state.benchmark_score,
            taken_at: Utc::now(),
        };
        let name = format!(
            "{}-v{}",
            meta.taken_at.format("%Y%m%dT%H%M%S%.6fZ"),
            state.version
        );
        let dir = self.dir.join(SNAPSHOT_DIR).join(name);
        write_state(&dir, state).await?;
        jsonl::write_atomic(&dir.join(META_FILE), &serde_json::to_vec_pretty(&meta)?).await?;

        let pruned = self.prune().await?;
        tracing::debug!(version = state.version, pruned, "self-state snapshot taken");
        Ok(meta)
    }

    /// Snapshots oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot directory cannot be listed.
    pub async fn history(&self) -> Result<Vec<SnapshotMeta>, KernelError> {
        Ok(self.snapshots().await?.into_iter().map(|(_, m)| m).collect())
    }

    /// Newest snapshot holding `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read.
    pub async fn find(&self, version: u64) -> Result<Option<SelfState>, KernelError> {
        for (path, meta) in self.snapshots().await?.into_iter().rev() {
            if meta.version == version {
                return read_state(&path).await;
            }
        }
        Ok(None)
    }

    /// # Errors
    ///
    /// Returns an error if the record cannot be appended.
    pub async fn append_benchmark(&self, report: &BenchmarkReport) -> Result<(), KernelError> {
        jsonl::append(&self.dir.join(BENCHMARK_FILE), report).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub async fn benchmarks(&self) -> Result<Vec<BenchmarkReport>, KernelError> {
        Ok(jsonl::read_all(&self.dir.join(BENCHMARK_FILE)).await?)
    }

    async fn snapshots(&self) -> Result<Vec<(PathBuf, SnapshotMeta)>, KernelError> {
        let root = self.dir.join(SNAPSHOT_DIR);
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match tokio::fs::read(path.join(META_FILE)).await {
                Ok(bytes) => match serde_json::from_slice::<SnapshotMeta>(&bytes) {
                    Ok(meta) => found.push((path, meta)),
                    Err(e) => tracing::warn!("skipping snapshot {}: {e}", path.display()),
                },
                Err(e) => tracing::warn!("skipping snapshot {}: {e}", path.display()),
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Drop the oldest snapshots over the limit, always keeping the very first one.
    async fn prune(&self) -> Result<usize, KernelError> {
        let snapshots = self.snapshots().await?;
        if snapshots.len() <= self.max_snapshots {
            return Ok(0);
        }
        let excess = snapshots.len() - self.max_snapshots.max(1);
        for (path, _) in snapshots.iter().skip(1).take(excess) {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(excess)
    }
}

async fn read_state(dir: &Path) -> Result<Option<SelfState>, KernelError> {
    let params_path = dir.join(PARAMS_FILE);
    let prompt_path = dir.join(PROMPT_FILE);
    if !tokio::fs::try_exists(&params_path).await? && !tokio::fs::try_exists(&prompt_path).await? {
        return Ok(None);
    }

    let record = match tokio::fs::read(&params_path).await {
        Ok(bytes) => serde_json::from_slice::<ParamsRecord>(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ParamsRecord {
            version: 0,
            benchmark_score: None,
            params: Params::default(),
        },
        Err(e) => return Err(e.into()),
    };
    let prompt = match tokio::fs::read_to_string(&prompt_path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let rules: Vec<Rule> = jsonl::read_all(&dir.join(RULES_FILE)).await?;

    Ok(Some(SelfState {
        version: record.version,
        prompt,
        params: record.params,
        rules,
        benchmark_score: record.benchmark_score,
    }))
}

async fn write_state(dir: &Path, state: &SelfState) -> Result<(), KernelError> {
    tokio::fs::create_dir_all(dir).await?;

    let mut rules = Vec::new();
    for rule in &state.rules {
        serde_json::to_writer(&mut rules, rule)?;
        rules.push(b'\n');
    }
    jsonl::write_atomic(&dir.join(RULES_FILE), &rules).await?;
    jsonl::write_atomic(&dir.join(PROMPT_FILE), state.prompt.as_bytes()).await?;

    let record = ParamsRecord {
        version: state.version,
        benchmark_score: state.benchmark_score,
        params: state.params.clone(),
    };
    jsonl::write_atomic(&dir.join(PARAMS_FILE), &serde_json::to_vec_pretty(&record)?).await?;
    Ok(())
}
