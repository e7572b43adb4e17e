//! The self-management tools: `self_state` over the kernel and `evolve` over the pipeline.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use ember_llm::LlmProvider;
use ember_tools::{ToolError, TypedTool};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::evolution::{EvolvePipeline, StepStatus};
use crate::self_state::SelfStateKernel;

const DEFAULT_REASON: &str = "requested by the agent";

fn require<T>(value: Option<T>, field: &str, action: &str) -> Result<T, ToolError> {
    value.ok_or_else(|| ToolError::InvalidParams {
        message: format!("action `{action}` needs `{field}`"),
    })
}

fn failed(e: impl std::fmt::Display) -> ToolError {
    ToolError::Failed(e.to_string())
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelfStateAction {
    View,
    SetPrompt,
    SetParam,
    AddRule,
    RemoveRule,
    ToggleRule,
    Rollback,
    History,
    Benchmark,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SelfStateParams {
    pub action: SelfStateAction,
    /// Full replacement prompt (set_prompt). Must keep mentioning the self_state and evolve tools.
    #[serde(default)]
    pub prompt: Option<String>,
    /// temperature, max_turns, compress_at, reflect_on_tools, preferred_lang or verbosity (set_param)
    #[serde(default)]
    pub param: Option<String>,
    /// New parameter value (set_param)
    #[serde(default)]
    pub value: Option<Value>,
    /// Rule text (add_rule)
    #[serde(default)]
    pub text: Option<String>,
    /// Rule id (remove_rule, toggle_rule)
    #[serde(default)]
    pub rule_id: Option<String>,
    /// Desired rule state (toggle_rule). Flips the rule when omitted.
    #[serde(default)]
    pub active: Option<bool>,
    /// Version to restore (rollback). 0 is the factory state.
    #[serde(default)]
    pub version: Option<u64>,
    /// Why the change is made, stored with the snapshot
    #[serde(default)]
    pub reason: Option<String>,
}

/// Lets the model inspect and change its own prompt, parameters and rules.
pub struct SelfStateTool<P> {
    kernel: Arc<SelfStateKernel>,
    aux: P,
}

impl<P> SelfStateTool<P> {
    /// `aux` answers the benchmark probes.
    #[must_use]
    pub fn new(kernel: Arc<SelfStateKernel>, aux: P) -> Self {
        Self { kernel, aux }
    }
}

impl<P: LlmProvider + 'static> SelfStateTool<P> {
    async fn view(&self) -> String {
        let s = self.kernel.current().await;
        let mut out = String::new();
        let _ = writeln!(out, "version: {}", s.version);
        if let Some(score) = s.benchmark_score {
            let _ = writeln!(out, "benchmark score: {score:.2}");
        }
        let _ = writeln!(
            out,
            "params: {}",
            serde_json::to_string(&s.params).unwrap_or_default()
        );
        if s.rules.is_empty() {
            out.push_str("rules: none\n");
        } else {
            out.push_str("rules:\n");
            for r in &s.rules {
                let flag = if r.active { "on" } else { "off" };
                let _ = writeln!(out, "  [{}] ({flag}) {}", r.id, r.text);
            }
        }
        let _ = write!(out, "prompt:\n{}", s.prompt);
        out
    }

    async fn history(&self) -> Result<String, ToolError> {
        let history = self.kernel.history().await.map_err(failed)?;
        if history.is_empty() {
            return Ok("no snapshots yet".to_owned());
        }
        let mut out = String::new();
        for meta in history {
            let _ = write!(
                out,
                "v{} at {}: {}",
                meta.version,
                meta.taken_at.format("%Y-%m-%d %H:%M:%S"),
                meta.reason
            );
            if let Some(score) = meta.score {
                let _ = write!(out, " (score {score:.2})");
            }
            out.push('\n');
        }
        let _ = write!(out, "current: v{}", self.kernel.version().await);
        Ok(out)
    }

    async fn benchmark(&self) -> Result<String, ToolError> {
        let report = self.kernel.benchmark(&self.aux).await.map_err(failed)?;
        let mut out = format!("v{} overall {:.2}\n", report.version, report.overall);
        for (category, score) in &report.categories {
            let _ = writeln!(out, "  {}: {score:.2}", category.as_str());
        }
        for r in &report.results {
            let _ = writeln!(out, "  {} {:.2}", r.id, r.score);
        }
        Ok(out.trim_end().to_owned())
    }
}

impl<P: LlmProvider + 'static> TypedTool for SelfStateTool<P> {
    type Params = SelfStateParams;

    fn name(&self) -> &str {
        "self_state"
    }

    fn description(&self) -> &str {
        "View or change your own system prompt, parameters and rules. Every change is validated, \
         snapshotted and versioned; rollback restores an earlier version; benchmark scores the \
         current configuration."
    }

    async fn run(&self, params: SelfStateParams) -> Result<String, ToolError> {
        let reason = params.reason.as_deref().unwrap_or(DEFAULT_REASON);
        let k = &self.kernel;
        match params.action {
            SelfStateAction::View => Ok(self.view().await),
            SelfStateAction::SetPrompt => {
                let prompt = require(params.prompt, "prompt", "set_prompt")?;
                let s = k.set_prompt(prompt, reason).await.map_err(failed)?;
                Ok(format!("prompt updated, now version {}", s.version))
            }
            SelfStateAction::SetParam => {
                let name = require(params.param, "param", "set_param")?;
                let value = match require(params.value, "value", "set_param")? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let s = k.set_param(&name, &value, reason).await.map_err(failed)?;
                Ok(format!("{name} set to {value}, now version {}", s.version))
            }
            SelfStateAction::AddRule => {
                let text = require(params.text, "text", "add_rule")?;
                let rule = k.add_rule(&text, reason).await.map_err(failed)?;
                Ok(format!("added rule {}, now version {}", rule.id, k.version().await))
            }
            SelfStateAction::RemoveRule => {
                let id = require(params.rule_id, "rule_id", "remove_rule")?;
                let rule = k.remove_rule(&id, reason).await.map_err(failed)?;
                Ok(format!("removed rule {} ({}), now version {}", rule.id, rule.text, k.version().await))
            }
            SelfStateAction::ToggleRule => {
                let id = require(params.rule_id, "rule_id", "toggle_rule")?;
                let rule = k.toggle_rule(&id, params.active, reason).await.map_err(failed)?;
                let state = if rule.active { "active" } else { "inactive" };
                Ok(format!("rule {} is now {state}, now version {}", rule.id, k.version().await))
            }
            SelfStateAction::Rollback => {
                let target = require(params.version, "version", "rollback")?;
                let s = k.rollback(target, reason).await.map_err(failed)?;
                Ok(format!("restored version {target} as version {}", s.version))
            }
            SelfStateAction::History => self.history().await,
            SelfStateAction::Benchmark => self.benchmark().await,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EvolveAction {
    Patch,
    BuildTest,
    Deploy,
    Abort,
    Status,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EvolveParams {
    pub action: EvolveAction,
    /// Source file relative to the project root (patch)
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Exact text to replace; must occur exactly once in the file, whitespace included (patch)
    #[serde(default)]
    pub old_text: Option<String>,
    /// Replacement text (patch). Empty deletes `old_text`.
    #[serde(default)]
    pub new_text: Option<String>,
    /// What the patch does (patch)
    #[serde(default)]
    pub description: Option<String>,
    /// Why the change is deployed, used in the commit message (deploy)
    #[serde(default)]
    pub reason: Option<String>,
}

/// Lets the model patch, rebuild, test and redeploy its own source.
pub struct EvolveTool {
    pipeline: Arc<EvolvePipeline>,
}

impl EvolveTool {
    #[must_use]
    pub fn new(pipeline: Arc<EvolvePipeline>) -> Self {
        Self { pipeline }
    }
}

impl TypedTool for EvolveTool {
    type Params = EvolveParams;

    fn name(&self) -> &str {
        "evolve"
    }

    fn description(&self) -> &str {
        "Modify your own source code. patch applies one exact text substitution, build_test \
         compiles and runs the tests, deploy installs the tested binary and restarts, abort \
         restores the original source, status shows the session."
    }

    async fn run(&self, params: EvolveParams) -> Result<String, ToolError> {
        let p = &self.pipeline;
        match params.action {
            EvolveAction::Patch => {
                let file = require(params.file, "file", "patch")?;
                let old_text = require(params.old_text, "old_text", "patch")?;
                let new_text = params.new_text.unwrap_or_default();
                let description = params.description.unwrap_or_else(|| "unnamed change".into());
                let n = p
                    .patch(&file, &old_text, &new_text, &description)
                    .await
                    .map_err(failed)?;
                Ok(format!(
                    "patch {n} applied to {}. Run build_test before deploying.",
                    file.display()
                ))
            }
            EvolveAction::BuildTest => {
                let report = p.build_test().await.map_err(failed)?;
                let mut out = format!("build: {}\ntest: {}", report.build, report.test);
                if report.build == StepStatus::Failed {
                    let _ = write!(out, "\n--- build output ---\n{}", report.build_output);
                } else if report.test == StepStatus::Failed {
                    let _ = write!(out, "\n--- test output ---\n{}", report.test_output);
                } else {
                    out.push_str("\nReady to deploy.");
                }
                Ok(out)
            }
            EvolveAction::Deploy => {
                let reason = params.reason.unwrap_or_else(|| DEFAULT_REASON.into());
                let report = p.deploy(&reason).await.map_err(failed)?;
                Ok(format!(
                    "deployed {} patch(es), commit {}. Restarting in {} ms; clients will reconnect.",
                    report.patch_count,
                    report.commit.as_deref().unwrap_or("none"),
                    p.settings().grace.as_millis()
                ))
            }
            EvolveAction::Abort => {
                let restored = p.abort().await.map_err(failed)?;
                Ok(format!("aborted, restored {restored} file(s) to their original content"))
            }
            EvolveAction::Status => Ok(p.status().await.to_string().trim_end().to_owned()),
        }
    }
}
