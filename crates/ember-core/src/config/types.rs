use std::path::PathBuf;

use ember_tools::ToolsConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub self_state: SelfStateConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub playbook: PlaybookConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Overall deadline for one user turn, model calls and tools included.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_true")]
    pub title_generation: bool,
    /// Identical tool rounds in a row before the loop gives up.
    #[serde(default = "default_doom_loop_window")]
    pub doom_loop_window: usize,
}

fn default_agent_name() -> String {
    "Ember".into()
}

fn default_turn_timeout_secs() -> u64 {
    180
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_true() -> bool {
    true
}

fn default_doom_loop_window() -> usize {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            turn_timeout_secs: default_turn_timeout_secs(),
            max_tokens: default_max_tokens(),
            title_generation: true,
            doom_loop_window: default_doom_loop_window(),
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Lighter model for titles, summaries, reflection and benchmarks. Falls back to `model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_model: Option<String>,
    #[serde(default = "default_true")]
    pub stream: bool,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("aux_model", &self.aux_model)
            .field("stream", &self.stream)
            .finish()
    }
}

fn default_base_url() -> String {
    "http://localhost:8080/v1".into()
}

fn default_model() -> String {
    "qwen3-8b".into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            aux_model: None,
            stream: true,
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn aux_model(&self) -> &str {
        self.aux_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.model)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Root for thread logs, self-state, playbook and audit records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CompactionConfig {
    /// Tail kept verbatim by normal compaction. `None` keeps `compress_at` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_recent: Option<usize>,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default = "default_forced_keep_recent")]
    pub forced_keep_recent: usize,
    #[serde(default = "default_forced_truncate_chars")]
    pub forced_truncate_chars: usize,
    #[serde(default = "default_forced_summary_max_tokens")]
    pub forced_summary_max_tokens: u32,
    /// Threads longer than this are compacted on a timeout; shorter ones blame the model.
    #[serde(default = "default_long_thread_messages")]
    pub long_thread_messages: usize,
}

fn default_summary_max_tokens() -> u32 {
    1024
}

fn default_forced_keep_recent() -> usize {
    10
}

fn default_forced_truncate_chars() -> usize {
    400
}

fn default_forced_summary_max_tokens() -> u32 {
    256
}

fn default_long_thread_messages() -> usize {
    30
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            keep_recent: None,
            summary_max_tokens: default_summary_max_tokens(),
            forced_keep_recent: default_forced_keep_recent(),
            forced_truncate_chars: default_forced_truncate_chars(),
            forced_summary_max_tokens: default_forced_summary_max_tokens(),
            long_thread_messages: default_long_thread_messages(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SelfStateConfig {
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

fn default_max_snapshots() -> usize {
    50
}

impl Default for SelfStateConfig {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMode {
    /// Replace the process image in place.
    #[default]
    Exec,
    /// Exit with code 75 and let a supervisor start the new binary.
    Exit,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EvolutionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    /// Binary replaced on deploy. Defaults to the running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    #[serde(default = "default_bin_name")]
    pub bin_name: String,
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_evolve_output_chars")]
    pub max_output_chars: usize,
    #[serde(default)]
    pub restart: RestartMode,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_bin_name() -> String {
    "ember".into()
}

fn default_build_timeout_secs() -> u64 {
    1800
}

fn default_grace_ms() -> u64 {
    1500
}

fn default_evolve_output_chars() -> usize {
    20_000
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_dir: default_source_dir(),
            binary: None,
            bin_name: default_bin_name(),
            build_timeout_secs: default_build_timeout_secs(),
            grace_ms: default_grace_ms(),
            max_output_chars: default_evolve_output_chars(),
            restart: RestartMode::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PlaybookConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_bullets")]
    pub max_bullets: usize,
    #[serde(default = "default_miss_floor")]
    pub miss_floor: u32,
    /// Bullets injected into the system prompt per turn.
    #[serde(default = "default_inject_top")]
    pub inject_top: usize,
}

fn default_max_bullets() -> usize {
    100
}

fn default_miss_floor() -> u32 {
    3
}

fn default_inject_top() -> usize {
    8
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bullets: default_max_bullets(),
            miss_floor: default_miss_floor(),
            inject_top: default_inject_top(),
        }
    }
}
