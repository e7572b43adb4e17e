use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prompt every fresh install starts from. Version 0 is rebuilt from this, never read from disk.
pub const FACTORY_PROMPT: &str = "\
You are Ember, a local assistant that runs on the operator's own machine. You answer \
questions, work with files and run shell commands through the tools you are given.

Guidelines:
- Call a tool whenever the answer depends on files, commands or the current state of the system. \
Do not guess file contents or command output.
- Read a file before you change it. Explain destructive commands before running them.
- When a tool returns an error, read it, fix the arguments and try again or choose another approach.
- Keep answers focused on what the user asked.

Self-management:
- Use the self_state tool to view or adjust your own prompt, parameters and rules, to roll back \
to an earlier version, or to benchmark the current configuration.
- Use the evolve tool to patch, build, test and deploy your own source code. Only deploy after \
a green build and a green test run, and abort the session if you cannot get there.";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Terse,
    #[default]
    Normal,
    Detailed,
}

impl std::str::FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terse" => Ok(Self::Terse),
            "normal" => Ok(Self::Normal),
            "detailed" => Ok(Self::Detailed),
            other => Err(format!("unknown verbosity {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub temperature: f32,
    pub max_turns: u32,
    /// Countable messages a thread may hold before pre-emptive compaction.
    pub compress_at: usize,
    pub reflect_on_tools: bool,
    pub preferred_lang: String,
    pub verbosity: Verbosity,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_turns: 10,
            compress_at: 60,
            reflect_on_tools: true,
            preferred_lang: "en".into(),
            verbosity: Verbosity::Normal,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelfState {
    pub version: u64,
    pub prompt: String,
    pub params: Params,
    pub rules: Vec<Rule>,
    /// Overall score of the last benchmark run against this version.
    pub benchmark_score: Option<f64>,
}

impl SelfState {
    #[must_use]
    pub fn factory() -> Self {
        Self {
            version: 0,
            prompt: FACTORY_PROMPT.to_owned(),
            params: Params::default(),
            rules: Vec::new(),
            benchmark_score: None,
        }
    }

    /// Prompt plus active rules and the language and verbosity directives.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.prompt.trim_end().to_owned();

        let active: Vec<&Rule> = self.rules.iter().filter(|r| r.active).collect();
        if !active.is_empty() {
            out.push_str("\n\n## Rules\n");
            for rule in active {
                out.push_str("- ");
                out.push_str(&rule.text);
                out.push('\n');
            }
        }

        if !self.params.preferred_lang.eq_ignore_ascii_case("en") {
            out.push_str("\n\nReply in ");
            out.push_str(&self.params.preferred_lang);
            out.push_str(" unless the user writes in another language.");
        }
        match self.params.verbosity {
            Verbosity::Terse => out.push_str("\n\nKeep answers as short as possible."),
            Verbosity::Normal => {}
            Verbosity::Detailed => {
                out.push_str("\n\nGive thorough answers with explanations and examples.");
            }
        }
        out
    }
}

/// Header of a snapshot directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub version: u64,
    pub reason: String,
    pub score: Option<f64>,
    pub taken_at: DateTime<Utc>,
}
