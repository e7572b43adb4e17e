//! Fixed probe battery scored against the current system prompt.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use ember_llm::{ChatOptions, LlmProvider, Message, ToolChoice};
use regex::Regex;
use serde::{Deserialize, Serialize};

const REPLY_EXCERPT_CHARS: usize = 300;

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number pattern"));

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Instruction,
    Reasoning,
    SelfKnowledge,
}

impl Category {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instruction => "instruction",
            Self::Reasoning => "reasoning",
            Self::SelfKnowledge => "self_knowledge",
        }
    }
}

/// How a probe reply is turned into a score in `0.0..=1.0`.
#[derive(Clone, Debug, PartialEq)]
pub enum Scorer {
    /// 1.0 when any needle occurs in the reply, case-insensitive.
    Contains(&'static [&'static str]),
    /// Fraction of keywords found in the reply.
    KeywordOverlap(&'static [&'static str]),
    /// 1.0 when the first number in the reply lies in the range.
    NumericRange { min: f64, max: f64 },
}

impl Scorer {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, reply: &str) -> f64 {
        let lower = reply.to_lowercase();
        match self {
            Self::Contains(needles) => {
                if needles.iter().any(|n| lower.contains(&n.to_lowercase())) {
                    1.0
                } else {
                    0.0
                }
            }
            Self::KeywordOverlap(keywords) => {
                if keywords.is_empty() {
                    return 0.0;
                }
                let hits = keywords
                    .iter()
                    .filter(|k| lower.contains(&k.to_lowercase()))
                    .count();
                hits as f64 / keywords.len() as f64
            }
            Self::NumericRange { min, max } => NUMBER
                .find(reply)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .filter(|n| (*min..=*max).contains(n))
                .map_or(0.0, |_| 1.0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Probe {
    pub id: &'static str,
    pub category: Category,
    pub prompt: &'static str,
    pub scorer: Scorer,
}

#[must_use]
pub fn probes() -> Vec<Probe> {
    vec![
        Probe {
            id: "exact_word",
            category: Category::Instruction,
            prompt: "Reply with exactly the word OK and nothing else.",
            scorer: Scorer::Contains(&["ok"]),
        },
        Probe {
            id: "list_colors",
            category: Category::Instruction,
            prompt: "Name the three primary colors of paint, separated by commas.",
            scorer: Scorer::KeywordOverlap(&["red", "blue", "yellow"]),
        },
        Probe {
            id: "multiply",
            category: Category::Reasoning,
            prompt: "What is 17 multiplied by 3? Answer with the number only.",
            scorer: Scorer::NumericRange {
                min: 51.0,
                max: 51.0,
            },
        },
        Probe {
            id: "train_speed",
            category: Category::Reasoning,
            prompt: "A train covers 60 km in 45 minutes. What is its average speed in km/h? \
                     Answer with the number only.",
            scorer: Scorer::NumericRange {
                min: 79.5,
                max: 80.5,
            },
        },
        Probe {
            id: "self_edit_tool",
            category: Category::SelfKnowledge,
            prompt: "Which of your tools changes your own system prompt, parameters or rules? \
                     Give its exact name.",
            scorer: Scorer::Contains(&["self_state"]),
        },
        Probe {
            id: "rebuild_tool",
            category: Category::SelfKnowledge,
            prompt: "Which of your tools patches and rebuilds your own source code? \
                     Give its exact name.",
            scorer: Scorer::Contains(&["evolve"]),
        },
    ]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: String,
    pub category: Category,
    pub score: f64,
    pub reply: String,
}

/// One benchmark run, persisted as a line of `benchmarks.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub version: u64,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub overall: f64,
    pub categories: BTreeMap<Category, f64>,
    pub results: Vec<ProbeResult>,
}

/// Run every probe with `system_prompt` as the system message.
///
/// A failed probe scores zero rather than aborting the run.
pub async fn run_benchmark<P: LlmProvider>(
    provider: &P,
    system_prompt: &str,
    version: u64,
) -> BenchmarkReport {
    let options = ChatOptions {
        max_tokens: 256,
        temperature: 0.0,
        tool_choice: ToolChoice::None,
    };

    let mut results = Vec::new();
    for probe in probes() {
        let messages = [Message::system(system_prompt), Message::user(probe.prompt)];
        let (score, reply) = match provider.chat(&messages, &[], &options).await {
            Ok(resp) => (probe.scorer.score(&resp.content), resp.content),
            Err(e) => {
                tracing::warn!(probe = probe.id, "benchmark probe failed: {e}");
                (0.0, format!("Error: {e}"))
            }
        };
        tracing::debug!(probe = probe.id, score, "benchmark probe scored");
        results.push(ProbeResult {
            id: probe.id.to_owned(),
            category: probe.category,
            score,
            reply: reply.chars().take(REPLY_EXCERPT_CHARS).collect(),
        });
    }

    let mut grouped: BTreeMap<Category, Vec<f64>> = BTreeMap::new();
    for r in &results {
        grouped.entry(r.category).or_default().push(r.score);
    }
    let categories = grouped
        .into_iter()
        .map(|(cat, scores)| (cat, mean(&scores)))
        .collect();
    let overall = mean(&results.iter().map(|r| r.score).collect::<Vec<_>>());

    BenchmarkReport {
        version,
        model: provider.name().to_owned(),
        timestamp: Utc::now(),
        overall,
        categories,
        results,
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
