use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use ember_llm::LlmProvider;
use tokio::sync::RwLock;

use super::KernelError;
use super::benchmark::{BenchmarkReport, run_benchmark};
use super::store::StateStore;
use super::types::{Params, Rule, SelfState, SnapshotMeta, Verbosity};
use super::validate::{repair, validate};

/// Process-wide owner of the self-state. Reads share a lock, every transition is exclusive.
#[derive(Debug)]
pub struct SelfStateKernel {
    state: RwLock<SelfState>,
    store: StateStore,
}

impl SelfStateKernel {
    /// Load the stored state from `dir` (repairing it) or start from the factory state.
    ///
    /// # Errors
    ///
    /// Returns an error if stored files exist but cannot be read.
    pub async fn open(dir: PathBuf, max_snapshots: usize) -> Result<Self, KernelError> {
        let store = StateStore::new(dir, max_snapshots);
        let state = match store.load().await? {
            Some(mut state) => {
                if !repair(&mut state).is_empty() {
                    store.save(&state).await?;
                }
                state
            }
            None => SelfState::factory(),
        };
        tracing::info!(version = state.version, rules = state.rules.len(), "self-state loaded");
        Ok(Self {
            state: RwLock::new(state),
            store,
        })
    }

    pub async fn current(&self) -> SelfState {
        self.state.read().await.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub async fn params(&self) -> Params {
        self.state.read().await.params.clone()
    }

    pub async fn system_prompt(&self) -> String {
        self.state.read().await.render()
    }

    /// Apply `change` to a copy of the state and commit it if it validates.
    ///
    /// On any error the live state and the files on disk are left as they were.
    ///
    /// # Errors
    ///
    /// Returns the error from `change`, the violated validation rule, or a persistence error.
    pub async fn mutate<F>(&self, reason: &str, change: F) -> Result<SelfState, KernelError>
    where
        F: FnOnce(&mut SelfState) -> Result<(), KernelError>,
    {
        let mut guard = self.state.write().await;
        let mut candidate = guard.clone();
        change(&mut candidate)?;
        if let Err(e) = validate(&candidate) {
            tracing::warn!(version = guard.version, reason, "self-state mutation rejected: {e}");
            return Err(e.into());
        }

        self.store.snapshot(&guard, reason).await?;
        candidate.version = guard.version + 1;
        candidate.benchmark_score = None;
        self.store.save(&candidate).await?;
        *guard = candidate.clone();
        tracing::info!(version = candidate.version, reason, "self-state committed");
        Ok(candidate)
    }

    /// # Errors
    ///
    /// See [`Self::mutate`].
    pub async fn set_prompt(&self, prompt: String, reason: &str) -> Result<SelfState, KernelError> {
        self.mutate(reason, |s| {
            s.prompt = prompt;
            Ok(())
        })
        .await
    }

    /// Set one parameter from its text form.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnknownParam`], [`KernelError::InvalidValue`] or a rejection.
    pub async fn set_param(
        &self,
        name: &str,
        value: &str,
        reason: &str,
    ) -> Result<SelfState, KernelError> {
        self.mutate(reason, |s| {
            let p = &mut s.params;
            match name {
                "temperature" => p.temperature = parse_value(name, value)?,
                "max_turns" => p.max_turns = parse_value(name, value)?,
                "compress_at" => p.compress_at = parse_value(name, value)?,
                "reflect_on_tools" => p.reflect_on_tools = parse_value(name, value)?,
                "preferred_lang" => value.trim().clone_into(&mut p.preferred_lang),
                "verbosity" => p.verbosity = parse_value::<Verbosity>(name, value)?,
                other => return Err(KernelError::UnknownParam(other.to_owned())),
            }
            Ok(())
        })
        .await
    }

    /// # Errors
    ///
    /// See [`Self::mutate`].
    pub async fn add_rule(&self, text: &str, reason: &str) -> Result<Rule, KernelError> {
        let rule = Rule {
            id: new_rule_id(),
            text: text.trim().to_owned(),
            reason: reason.to_owned(),
            active: true,
        };
        let added = rule.clone();
        self.mutate(reason, move |s| {
            s.rules.push(rule);
            Ok(())
        })
        .await?;
        Ok(added)
    }

    /// # Errors
    ///
    /// Returns [`KernelError::RuleNotFound`] for an unknown id.
    pub async fn remove_rule(&self, id: &str, reason: &str) -> Result<Rule, KernelError> {
        let mut removed = None;
        self.mutate(reason, |s| {
            let idx = rule_index(s, id)?;
            removed = Some(s.rules.remove(idx));
            Ok(())
        })
        .await?;
        removed.ok_or_else(|| KernelError::RuleNotFound(id.to_owned()))
    }

    /// Flip a rule, or set it to `active` when given.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::RuleNotFound`] for an unknown id.
    pub async fn toggle_rule(
        &self,
        id: &str,
        active: Option<bool>,
        reason: &str,
    ) -> Result<Rule, KernelError> {
        let state = self
            .mutate(reason, |s| {
                let idx = rule_index(s, id)?;
                let rule = &mut s.rules[idx];
                rule.active = active.unwrap_or(!rule.active);
                Ok(())
            })
            .await?;
        state
            .rules
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| KernelError::RuleNotFound(id.to_owned()))
    }

    /// Restore the content of `target` as a new version.
    ///
    /// Version 0 is rebuilt from the factory defaults; others come from their snapshot.
    /// Validation is skipped, load-time repair is not. Rolling back to 0 while still at
    /// 0 returns the factory state unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is current (and not 0), newer, or has no snapshot.
    pub async fn rollback(&self, target: u64, reason: &str) -> Result<SelfState, KernelError> {
        let mut guard = self.state.write().await;
        let current = guard.version;
        if target == 0 && current == 0 {
            tracing::debug!(reason, "rollback to factory state on a fresh kernel is a no-op");
            return Ok(guard.clone());
        }
        if target == current {
            return Err(KernelError::AlreadyCurrent(current));
        }
        if target > current {
            return Err(KernelError::FutureVersion { target, current });
        }

        let mut restored = if target == 0 {
            SelfState::factory()
        } else {
            self.store
                .find(target)
                .await?
                .ok_or(KernelError::SnapshotNotFound(target))?
        };
        repair(&mut restored);

        self.store.snapshot(&guard, reason).await?;
        restored.version = current + 1;
        self.store.save(&restored).await?;
        *guard = restored.clone();
        tracing::info!(from = current, to = target, version = restored.version, reason, "self-state rolled back");
        Ok(restored)
    }

    /// # Errors
    ///
    /// Returns an error if the snapshot directory cannot be read.
    pub async fn history(&self) -> Result<Vec<SnapshotMeta>, KernelError> {
        self.store.history().await
    }

    /// Score the current system prompt with `provider` and record the result.
    ///
    /// The score is stored on the state without a version bump. If the state changed while
    /// the probes ran, only the report is recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the report or the score cannot be persisted.
    pub async fn benchmark<P: LlmProvider>(&self, provider: &P) -> Result<BenchmarkReport, KernelError> {
        let (prompt, version) = {
            let state = self.state.read().await;
            (state.render(), state.version)
        };
        let report = run_benchmark(provider, &prompt, version).await;
        self.store.append_benchmark(&report).await?;

        let mut guard = self.state.write().await;
        if guard.version == version {
            guard.benchmark_score = Some(report.overall);
            self.store.save(&guard).await?;
        } else {
            tracing::warn!(version, current = guard.version, "self-state changed during benchmark");
        }
        tracing::info!(version, overall = report.overall, "benchmark recorded");
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns an error if the benchmark record cannot be read.
    pub async fn benchmarks(&self) -> Result<Vec<BenchmarkReport>, KernelError> {
        self.store.benchmarks().await
    }
}

fn parse_value<T>(param: &str, value: &str) -> Result<T, KernelError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| KernelError::InvalidValue {
        param: param.to_owned(),
        value: value.to_owned(),
        reason: e.to_string(),
    })
}

fn rule_index(state: &SelfState, id: &str) -> Result<usize, KernelError> {
    state
        .rules
        .iter()
        .position(|r| r.id == id)
        .ok_or_else(|| KernelError::RuleNotFound(id.to_owned()))
}

fn new_rule_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
