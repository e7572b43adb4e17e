//! Self-Evolution Pipeline: patch the live source tree, build, test, deploy or abort.

pub mod deploy;
pub mod toolchain;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ember_memory::{MemoryError, jsonl};
use ember_tools::truncate_tool_output;
use serde::Serialize;
use tokio::sync::Mutex;

pub use deploy::{AuditRecord, ExecRestarter, ExitRestarter, Restarter, swap_binary};
pub use toolchain::{CargoToolchain, GitVcs, StepOutput, Toolchain, Vcs};

use crate::config::{EvolutionConfig, RestartMode};

#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    #[error("invalid patch path {0:?}: it must be relative to the source root and must not contain ..")]
    InvalidPath(String),

    #[error("old_text must not be empty")]
    EmptyPattern,

    #[error("old_text was not found in {file}")]
    NotFound { file: String },

    #[error("old_text is ambiguous in {file}: it occurs {count} times and must occur exactly once")]
    Ambiguous { file: String, count: usize },

    #[error("no evolution session in progress")]
    NoSession,

    #[error("deploy needs a green build and a green test run for the current patches (build: {build}, test: {test})")]
    NotReady { build: StepStatus, test: StepStatus },

    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("restart failed: {0}")]
    Restart(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    None,
    Patched,
    BuildFailed,
    TestFailed,
    Ready,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Patched => "patched",
            Self::BuildFailed => "build_failed",
            Self::TestFailed => "test_failed",
            Self::Ready => "ready",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Patch {
    pub file: PathBuf,
    pub old_text: String,
    pub new_text: String,
    pub description: String,
    pub applied: bool,
}

#[derive(Debug)]
struct EvolveSession {
    started_at: DateTime<Utc>,
    /// Content of each touched file as it was before the session first changed it.
    originals: BTreeMap<PathBuf, Vec<u8>>,
    patches: Vec<Patch>,
    build: StepStatus,
    test: StepStatus,
    build_output: String,
    test_output: String,
    temp_binary: Option<PathBuf>,
}

impl EvolveSession {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            originals: BTreeMap::new(),
            patches: Vec::new(),
            build: StepStatus::Pending,
            test: StepStatus::Pending,
            build_output: String::new(),
            test_output: String::new(),
            temp_binary: None,
        }
    }

    fn phase(&self) -> Phase {
        match (self.build, self.test) {
            (StepStatus::Failed, _) => Phase::BuildFailed,
            (StepStatus::Passed, StepStatus::Failed) => Phase::TestFailed,
            (StepStatus::Passed, StepStatus::Passed) => Phase::Ready,
            _ => Phase::Patched,
        }
    }

    async fn discard_binary(&mut self) {
        if let Some(path) = self.temp_binary.take()
            && let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("failed to remove {}: {e}", path.display());
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EvolveStatus {
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub patches: Vec<Patch>,
    pub build: StepStatus,
    pub test: StepStatus,
    pub build_output: String,
    pub test_output: String,
    pub temp_binary: Option<PathBuf>,
    pub last_outcome: Option<String>,
}

impl std::fmt::Display for EvolveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "phase: {}", self.phase)?;
        if let Some(outcome) = &self.last_outcome {
            writeln!(f, "last outcome: {outcome}")?;
        }
        if self.phase == Phase::None {
            return Ok(());
        }
        writeln!(f, "patches:")?;
        for (i, p) in self.patches.iter().enumerate() {
            writeln!(f, "  {}. {}: {}", i + 1, p.file.display(), p.description)?;
        }
        writeln!(f, "build: {}", self.build)?;
        writeln!(f, "test: {}", self.test)?;
        if self.build == StepStatus::Failed {
            writeln!(f, "build output:\n{}", self.build_output)?;
        }
        if self.test == StepStatus::Failed {
            writeln!(f, "test output:\n{}", self.test_output)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BuildTestReport {
    pub build: StepStatus,
    pub test: StepStatus,
    pub build_output: String,
    pub test_output: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub commit: Option<String>,
    pub patch_count: usize,
    pub binary: PathBuf,
    pub backup: PathBuf,
}

/// Where the pipeline works and how it restarts.
#[derive(Clone, Debug)]
pub struct EvolveSettings {
    pub source_dir: PathBuf,
    pub binary: PathBuf,
    pub audit_path: PathBuf,
    pub temp_dir: PathBuf,
    pub grace: Duration,
    pub max_output_chars: usize,
}

impl EvolveSettings {
    /// # Errors
    ///
    /// Returns an error if no binary is configured and the running executable cannot be found.
    pub fn from_config(config: &EvolutionConfig, data_dir: &Path) -> std::io::Result<Self> {
        let binary = match &config.binary {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self {
            source_dir: config.source_dir.clone(),
            binary,
            audit_path: data_dir.join("evolution.jsonl"),
            temp_dir: std::env::temp_dir(),
            grace: Duration::from_millis(config.grace_ms),
            max_output_chars: config.max_output_chars,
        })
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    session: Option<EvolveSession>,
    last_outcome: Option<String>,
}

/// Owner of the in-progress evolution session. Every transition holds one exclusive lock.
pub struct EvolvePipeline {
    settings: EvolveSettings,
    toolchain: Arc<dyn Toolchain>,
    vcs: Arc<dyn Vcs>,
    restarter: Arc<dyn Restarter>,
    state: Mutex<PipelineState>,
}

impl std::fmt::Debug for EvolvePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolvePipeline")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl EvolvePipeline {
    #[must_use]
    pub fn new(
        settings: EvolveSettings,
        toolchain: Arc<dyn Toolchain>,
        vcs: Arc<dyn Vcs>,
        restarter: Arc<dyn Restarter>,
    ) -> Self {
        Self {
            settings,
            toolchain,
            vcs,
            restarter,
            state: Mutex::new(PipelineState::default()),
        }
    }

    /// Cargo, git and the restart mode from config.
    ///
    /// # Errors
    ///
    /// See [`EvolveSettings::from_config`].
    pub fn from_config(config: &EvolutionConfig, data_dir: &Path) -> std::io::Result<Self> {
        let restarter: Arc<dyn Restarter> = match config.restart {
            RestartMode::Exec => Arc::new(ExecRestarter),
            RestartMode::Exit => Arc::new(ExitRestarter),
        };
        Ok(Self::new(
            EvolveSettings::from_config(config, data_dir)?,
            Arc::new(CargoToolchain::new(
                config.bin_name.clone(),
                Duration::from_secs(config.build_timeout_secs),
            )),
            Arc::new(GitVcs),
            restarter,
        ))
    }

    #[must_use]
    pub fn settings(&self) -> &EvolveSettings {
        &self.settings
    }

    /// Replace the single occurrence of `old_text` in `file` with `new_text`.
    ///
    /// Starts a session if none is active and invalidates any earlier build or test result.
    ///
    /// # Errors
    ///
    /// Returns [`EvolveError::NotFound`] or [`EvolveError::Ambiguous`] unless `old_text`
    /// occurs exactly once; the file is not touched in that case.
    pub async fn patch(
        &self,
        file: &Path,
        old_text: &str,
        new_text: &str,
        description: &str,
    ) -> Result<usize, EvolveError> {
        check_relative(file)?;
        if old_text.is_empty() {
            return Err(EvolveError::EmptyPattern);
        }

        let mut state = self.state.lock().await;
        let path = self.settings.source_dir.join(file);
        let content = tokio::fs::read_to_string(&path).await?;
        let shown = file.display().to_string();
        match occurrences(&content, old_text) {
            0 => return Err(EvolveError::NotFound { file: shown }),
            1 => {}
            count => return Err(EvolveError::Ambiguous { file: shown, count }),
        }

        let updated = content.replacen(old_text, new_text, 1);
        let session = state.session.get_or_insert_with(EvolveSession::new);
        session
            .originals
            .entry(file.to_path_buf())
            .or_insert_with(|| content.into_bytes());
        tokio::fs::write(&path, updated).await?;

        session.patches.push(Patch {
            file: file.to_path_buf(),
            old_text: old_text.to_owned(),
            new_text: new_text.to_owned(),
            description: description.to_owned(),
            applied: true,
        });
        session.build = StepStatus::Pending;
        session.test = StepStatus::Pending;
        session.build_output.clear();
        session.test_output.clear();
        session.discard_binary().await;

        let count = session.patches.len();
        tracing::info!(file = %shown, patches = count, "evolution patch applied");
        Ok(count)
    }

    /// Build the patched tree into a fresh temporary binary, then run the tests.
    ///
    /// Failures are recorded, not returned: the session stays open for another patch or
    /// an abort.
    ///
    /// # Errors
    ///
    /// Returns [`EvolveError::NoSession`] when nothing has been patched.
    pub async fn build_test(&self) -> Result<BuildTestReport, EvolveError> {
        let mut state = self.state.lock().await;
        let session = state.session.as_mut().ok_or(EvolveError::NoSession)?;
        session.discard_binary().await;

        let output = self
            .settings
            .temp_dir
            .join(format!("ember-evolve-{}", uuid::Uuid::new_v4().simple()));
        let source = &self.settings.source_dir;
        let limit = self.settings.max_output_chars;

        let build = self.toolchain.build(source, &output).await;
        session.build_output = truncate_tool_output(&build.output, limit);
        session.build = if build.ok { StepStatus::Passed } else { StepStatus::Failed };
        session.test = StepStatus::Pending;
        session.test_output.clear();

        if build.ok {
            session.temp_binary = Some(output);
            let test = self.toolchain.test(source).await;
            session.test_output = truncate_tool_output(&test.output, limit);
            session.test = if test.ok { StepStatus::Passed } else { StepStatus::Failed };
        } else {
            let _ = tokio::fs::remove_file(&output).await;
        }

        tracing::info!(build = %session.build, test = %session.test, "evolution build and test finished");
        Ok(BuildTestReport {
            build: session.build,
            test: session.test,
            build_output: session.build_output.clone(),
            test_output: session.test_output.clone(),
        })
    }

    /// Swap in the tested binary, commit the patches, audit, and schedule the restart.
    ///
    /// # Errors
    ///
    /// Returns [`EvolveError::NotReady`] without a green build and test for the current
    /// patches, or [`EvolveError::Deploy`] when the binary cannot be replaced. The running
    /// binary is untouched in both cases.
    pub async fn deploy(&self, reason: &str) -> Result<DeployReport, EvolveError> {
        let mut state = self.state.lock().await;
        let session = state.session.as_ref().ok_or(EvolveError::NoSession)?;
        let not_ready = EvolveError::NotReady {
            build: session.build,
            test: session.test,
        };
        if session.phase() != Phase::Ready {
            return Err(not_ready);
        }
        let Some(temp) = session.temp_binary.clone() else {
            return Err(not_ready);
        };
        let patch_count = session.patches.len();

        let backup = match swap_binary(&self.settings.binary, &temp).await {
            Ok(backup) => backup,
            Err(e) => {
                tracing::error!("evolution deploy failed: {e}");
                self.audit(None, patch_count, reason, Some(e.to_string())).await;
                return Err(EvolveError::Deploy(e.to_string()));
            }
        };

        let message = commit_message(reason, &session.patches);
        let commit = match self.vcs.commit(&self.settings.source_dir, &message).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("evolution commit failed, deploy continues: {}", e.trim());
                None
            }
        };
        self.audit(commit.clone(), patch_count, reason, None).await;

        if let Some(mut done) = state.session.take() {
            done.discard_binary().await;
        }
        state.last_outcome = Some(format!(
            "deployed {patch_count} patch(es), commit {}",
            commit.as_deref().unwrap_or("none")
        ));
        drop(state);

        tracing::info!(patch_count, commit = ?commit, "evolution deployed, restart scheduled");
        self.schedule_restart();

        Ok(DeployReport {
            commit,
            patch_count,
            binary: self.settings.binary.clone(),
            backup,
        })
    }

    /// Restore every touched file to its content before the session and drop the session.
    ///
    /// # Errors
    ///
    /// Returns [`EvolveError::NoSession`] when nothing is in progress, or an I/O error if a
    /// file cannot be restored (the session is kept so the abort can be retried).
    pub async fn abort(&self) -> Result<usize, EvolveError> {
        let mut state = self.state.lock().await;
        let session = state.session.as_mut().ok_or(EvolveError::NoSession)?;

        for (file, original) in &session.originals {
            tokio::fs::write(self.settings.source_dir.join(file), original).await?;
        }
        session.discard_binary().await;
        let restored = session.originals.len();
        state.session = None;
        state.last_outcome = Some(format!("aborted, restored {restored} file(s)"));
        tracing::info!(restored, "evolution aborted");
        Ok(restored)
    }

    pub async fn status(&self) -> EvolveStatus {
        let state = self.state.lock().await;
        let last_outcome = state.last_outcome.clone();
        match &state.session {
            None => EvolveStatus {
                phase: Phase::None,
                started_at: None,
                patches: Vec::new(),
                build: StepStatus::Pending,
                test: StepStatus::Pending,
                build_output: String::new(),
                test_output: String::new(),
                temp_binary: None,
                last_outcome,
            },
            Some(s) => EvolveStatus {
                phase: s.phase(),
                started_at: Some(s.started_at),
                patches: s.patches.clone(),
                build: s.build,
                test: s.test,
                build_output: s.build_output.clone(),
                test_output: s.test_output.clone(),
                temp_binary: s.temp_binary.clone(),
                last_outcome,
            },
        }
    }

    async fn audit(&self, commit: Option<String>, patch_count: usize, reason: &str, error: Option<String>) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            commit,
            patch_count,
            reason: reason.to_owned(),
            success: error.is_none(),
            error,
        };
        if let Err(e) = jsonl::append(&self.settings.audit_path, &record).await {
            tracing::error!("failed to write evolution audit record: {e}");
        }
    }

    fn schedule_restart(&self) {
        let restarter = Arc::clone(&self.restarter);
        let binary = self.settings.binary.clone();
        let grace = self.settings.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = restarter.restart(&binary) {
                tracing::error!("{e}");
            }
        });
    }
}

/// Occurrences of `pattern` in `content`, overlapping ones included.
fn occurrences(content: &str, pattern: &str) -> usize {
    let step = pattern.chars().next().map_or(1, char::len_utf8);
    let mut count = 0;
    let mut start = 0;
    while let Some(found) = content[start..].find(pattern) {
        count += 1;
        start += found + step;
    }
    count
}

fn check_relative(file: &Path) -> Result<(), EvolveError> {
    let ok = !file.as_os_str().is_empty()
        && file
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(EvolveError::InvalidPath(file.display().to_string()))
    }
}

fn commit_message(reason: &str, patches: &[Patch]) -> String {
    let mut msg = format!("evolve: {reason}\n\n");
    for p in patches {
        let _ = writeln!(msg, "- {}: {}", p.file.display(), p.description);
    }
    msg
}
