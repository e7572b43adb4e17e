//! Context Compressor: replace the old span of a thread with one summary message.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use ember_llm::{ChatOptions, LlmError, LlmProvider, Message, Role, ToolChoice};
use ember_memory::{SUMMARY_PREFIX, estimate_tokens};

use crate::config::CompactionConfig;

/// Per-message cap on summary input in normal mode.
const NORMAL_TRUNCATE_CHARS: usize = 2000;
const FALLBACK_EXCERPT_CHARS: usize = 200;

const SUMMARY_INSTRUCTIONS: &str = "\
You compress conversations. Summarize the transcript you are given into a short \
continuation note. Keep every fact the user stated, every piece of information that \
came from a tool (file names, paths, command output, numbers, errors), every decision \
made, and the topic currently being worked on. Write plain prose, no preamble.";

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("summarization failed: {0}")]
    Llm(#[from] LlmError),

    #[error("summarization returned an empty reply")]
    EmptySummary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionMode {
    Normal,
    Forced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionState {
    Idle,
    Compressing(CompactionMode),
}

#[derive(Debug)]
pub struct CompactionOutcome {
    /// System message (if any), summary, then the untouched tail.
    pub messages: Vec<Message>,
    pub summary: Message,
    /// Messages that were folded into the summary, summaries excluded.
    pub dropped: Vec<Message>,
    /// False when the summarization call failed and the span was truncated instead.
    pub summarized: bool,
}

#[must_use]
pub fn is_summary(msg: &Message) -> bool {
    msg.role == Role::Assistant && msg.content.starts_with(SUMMARY_PREFIX)
}

/// Messages that count toward the compaction threshold.
#[must_use]
pub fn countable_messages(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| m.role != Role::System && !is_summary(m))
        .count()
}

#[must_use]
pub fn needs_compaction(messages: &[Message], compress_at: usize) -> bool {
    countable_messages(messages) > compress_at
}

/// Index where the kept tail starts. Moves earlier while it would open on a tool result.
#[must_use]
pub fn tail_start(messages: &[Message], body_start: usize, keep: usize) -> usize {
    let mut start = messages.len().saturating_sub(keep).max(body_start);
    while start > body_start && messages[start].role == Role::Tool {
        start -= 1;
    }
    start
}

#[derive(Debug)]
pub struct ContextCompressor {
    config: CompactionConfig,
    normal: AtomicUsize,
    forced: AtomicUsize,
}

/// One in-flight compaction, counted per mode until dropped.
struct StateGuard<'a>(&'a AtomicUsize);

impl<'a> StateGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ContextCompressor {
    #[must_use]
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            normal: AtomicUsize::new(0),
            forced: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Idle only once every in-flight compaction has finished. Forced wins over normal.
    #[must_use]
    pub fn state(&self) -> CompactionState {
        if self.forced.load(Ordering::Acquire) > 0 {
            CompactionState::Compressing(CompactionMode::Forced)
        } else if self.normal.load(Ordering::Acquire) > 0 {
            CompactionState::Compressing(CompactionMode::Normal)
        } else {
            CompactionState::Idle
        }
    }

    fn enter(&self, mode: CompactionMode) -> StateGuard<'_> {
        StateGuard::enter(match mode {
            CompactionMode::Normal => &self.normal,
            CompactionMode::Forced => &self.forced,
        })
    }

    /// Whether a timed-out thread is long enough to blame its size rather than the model.
    #[must_use]
    pub fn is_long_thread(&self, messages: &[Message]) -> bool {
        countable_messages(messages) > self.config.long_thread_messages
    }

    fn keep_for(&self, mode: CompactionMode, compress_at: usize) -> usize {
        match mode {
            CompactionMode::Normal => self.config.keep_recent.unwrap_or(compress_at),
            CompactionMode::Forced => self.config.forced_keep_recent,
        }
    }

    /// Fold everything older than the kept tail into one summary message.
    ///
    /// Returns `None` when there is nothing old enough to fold. A failed summarization
    /// call degrades to a truncation notice rather than an error.
    pub async fn compact<P: LlmProvider>(
        &self,
        provider: &P,
        messages: &[Message],
        mode: CompactionMode,
        compress_at: usize,
    ) -> Option<CompactionOutcome> {
        let body_start = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
        let keep = self.keep_for(mode, compress_at);
        let split = tail_start(messages, body_start, keep);
        let old = &messages[body_start..split];

        let (prior, dropped): (Vec<&Message>, Vec<&Message>) =
            old.iter().partition(|m| is_summary(m));
        if dropped.is_empty() {
            return None;
        }

        let _guard = self.enter(mode);

        let carried: Vec<&str> = prior
            .iter()
            .map(|m| m.content.trim_start_matches(SUMMARY_PREFIX).trim())
            .collect();

        let result = self.summarize(provider, &carried, &dropped, mode).await;
        let (summary_text, summarized) = match result {
            Ok(text) => (text, true),
            Err(e) => {
                tracing::warn!("compaction summary failed, truncating instead: {e}");
                (fallback_summary(&carried, &dropped), false)
            }
        };

        let summary = Message::assistant(format!("{SUMMARY_PREFIX} {summary_text}"));
        let mut out = Vec::with_capacity(messages.len() - split + 2);
        out.extend(messages[..body_start].iter().cloned());
        out.push(summary.clone());
        out.extend(messages[split..].iter().cloned());

        tracing::info!(
            mode = ?mode,
            folded = dropped.len(),
            kept = messages.len() - split,
            summary_tokens = estimate_tokens(&summary.content),
            summarized,
            "compacted context"
        );

        Some(CompactionOutcome {
            messages: out,
            summary,
            dropped: dropped.into_iter().cloned().collect(),
            summarized,
        })
    }

    async fn summarize<P: LlmProvider>(
        &self,
        provider: &P,
        carried: &[&str],
        dropped: &[&Message],
        mode: CompactionMode,
    ) -> Result<String, CompactionError> {
        let (limit, max_tokens) = match mode {
            CompactionMode::Normal => (NORMAL_TRUNCATE_CHARS, self.config.summary_max_tokens),
            CompactionMode::Forced => (
                self.config.forced_truncate_chars,
                self.config.forced_summary_max_tokens,
            ),
        };

        let mut input = String::new();
        if !carried.is_empty() {
            input.push_str("Earlier summary:\n");
            for text in carried {
                input.push_str(text);
                input.push('\n');
            }
            input.push('\n');
        }
        input.push_str("Transcript:\n");
        input.push_str(&render_transcript(dropped, limit));

        let options = ChatOptions {
            max_tokens,
            temperature: 0.2,
            tool_choice: ToolChoice::None,
        };
        let resp = provider
            .chat(
                &[Message::system(SUMMARY_INSTRUCTIONS), Message::user(input)],
                &[],
                &options,
            )
            .await?;

        let text = resp.content.trim();
        if text.is_empty() {
            return Err(CompactionError::EmptySummary);
        }
        Ok(text.to_owned())
    }
}

/// One line per message, each cut to `limit` chars.
#[must_use]
pub fn render_transcript(messages: &[&Message], limit: usize) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push('[');
        out.push_str(msg.role.as_str());
        out.push_str("]: ");
        out.push_str(&truncate_chars(&msg.content, limit));
        for call in &msg.tool_calls {
            out.push_str("\n  called ");
            out.push_str(&call.name);
            out.push(' ');
            out.push_str(&truncate_chars(&call.arguments, limit));
        }
        out.push('\n');
    }
    out
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_owned(),
    }
}

fn fallback_summary(carried: &[&str], dropped: &[&Message]) -> String {
    let mut text = String::new();
    for prior in carried {
        text.push_str(prior);
        text.push(' ');
    }
    let _ = write!(
        text,
        "{} earlier messages were removed to fit the context window.",
        dropped.len()
    );
    if let Some(last_user) = dropped.iter().rev().find(|m| m.role == Role::User) {
        let excerpt: String = last_user.content.lines().take(3).collect::<Vec<_>>().join(" ");
        text.push_str(" The last removed request was: ");
        text.push_str(&truncate_chars(&excerpt, FALLBACK_EXCERPT_CHARS));
    }
    text
}

#[cfg(test)]
mod tests {
    use ember_llm::ToolCall;
    use ember_llm::mock::{MockProvider, MockReply};

    use super::*;

    fn thread(n: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..n {
            if i % 2 == 0 {
                msgs.push(Message::user(format!("question {i}")));
            } else {
                msgs.push(Message::assistant(format!("answer {i}")));
            }
        }
        msgs
    }

    fn compressor() -> ContextCompressor {
        ContextCompressor::new(CompactionConfig::default())
    }

    #[test]
    fn threshold_ignores_system_and_summaries() {
        let mut msgs = thread(60);
        assert!(!needs_compaction(&msgs, 60));
        msgs.push(Message::assistant(format!("{SUMMARY_PREFIX} old stuff")));
        assert!(!needs_compaction(&msgs, 60));
        msgs.push(Message::user("one more"));
        assert!(needs_compaction(&msgs, 60));
    }

    #[test]
    fn tail_never_opens_on_tool_result() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("go"),
            Message::assistant("").with_tool_calls(vec![ToolCall {
                id: "c1".into(),
                name: "shell".into(),
                arguments: "{}".into(),
            }]),
            Message::tool_result("c1", "ok"),
            Message::assistant("done"),
        ];
        assert_eq!(tail_start(&msgs, 1, 2), 2);
        assert_eq!(tail_start(&msgs, 1, 10), 1);
    }

    #[tokio::test]
    async fn seventy_messages_compress_to_system_summary_and_sixty() {
        let provider = MockProvider::with_responses(vec!["they talked about questions".into()]);
        let msgs = thread(70);
        let outcome = compressor()
            .compact(&provider, &msgs, CompactionMode::Normal, 60)
            .await
            .unwrap();

        assert_eq!(outcome.messages.len(), 62);
        assert_eq!(outcome.messages[0].role, Role::System);
        assert!(is_summary(&outcome.messages[1]));
        assert_eq!(outcome.messages[2].content, "question 10");
        assert_eq!(outcome.dropped.len(), 10);
        assert!(outcome.summarized);

        let call = &provider.calls()[0];
        assert!(call.tools.is_empty());
        assert_eq!(call.options.max_tokens, 1024);
        assert!(call.messages[1].content.contains("question 0"));
    }

    #[tokio::test]
    async fn prior_summary_is_carried_not_resummarized() {
        let provider = MockProvider::with_responses(vec!["newer".into()]);
        let mut msgs = vec![
            Message::system("sys"),
            Message::assistant(format!("{SUMMARY_PREFIX} the user likes rust")),
        ];
        msgs.extend(thread(20).into_iter().skip(1));
        let outcome = compressor()
            .compact(&provider, &msgs, CompactionMode::Forced, 60)
            .await
            .unwrap();

        assert_eq!(outcome.dropped.len(), 10);
        assert!(outcome.dropped.iter().all(|m| !is_summary(m)));
        let input = &provider.calls()[0].messages[1].content;
        assert!(input.starts_with("Earlier summary:\nthe user likes rust"));
        assert_eq!(provider.calls()[0].options.max_tokens, 256);
        assert_eq!(outcome.messages.len(), 1 + 1 + 10);
    }

    #[tokio::test]
    async fn forced_mode_truncates_each_message() {
        let provider = MockProvider::with_responses(vec!["short".into()]);
        let mut msgs = vec![Message::system("sys"), Message::user("x".repeat(1000))];
        msgs.extend(thread(12).into_iter().skip(1));
        compressor()
            .compact(&provider, &msgs, CompactionMode::Forced, 60)
            .await
            .unwrap();
        let input = &provider.calls()[0].messages[1].content;
        assert!(input.contains(&format!("{}...", "x".repeat(400))));
        assert!(!input.contains(&"x".repeat(401)));
    }

    #[tokio::test]
    async fn failed_summary_falls_back_to_truncation() {
        let provider = MockProvider::with_replies(vec![MockReply::Fatal("down".into())]);
        let outcome = compressor()
            .compact(&provider, &thread(70), CompactionMode::Normal, 60)
            .await
            .unwrap();
        assert!(!outcome.summarized);
        let summary = &outcome.messages[1].content;
        assert!(summary.starts_with(SUMMARY_PREFIX));
        assert!(summary.contains("10 earlier messages were removed"));
        assert!(summary.contains("question 8"));
    }

    #[tokio::test]
    async fn nothing_to_fold_returns_none() {
        let provider = MockProvider::default();
        let outcome = compressor()
            .compact(&provider, &thread(5), CompactionMode::Forced, 60)
            .await;
        assert!(outcome.is_none());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn state_returns_to_idle() {
        let c = compressor();
        let provider = MockProvider::default();
        c.compact(&provider, &thread(70), CompactionMode::Normal, 60)
            .await
            .unwrap();
        assert_eq!(c.state(), CompactionState::Idle);
    }

    #[test]
    fn overlapping_compactions_stay_busy_until_last_finishes() {
        let c = compressor();
        let first = c.enter(CompactionMode::Normal);
        let second = c.enter(CompactionMode::Forced);
        assert_eq!(
            c.state(),
            CompactionState::Compressing(CompactionMode::Forced)
        );
        drop(second);
        assert_eq!(
            c.state(),
            CompactionState::Compressing(CompactionMode::Normal)
        );
        let third = c.enter(CompactionMode::Normal);
        drop(first);
        assert_eq!(
            c.state(),
            CompactionState::Compressing(CompactionMode::Normal)
        );
        drop(third);
        assert_eq!(c.state(), CompactionState::Idle);
    }

    #[test]
    fn long_thread_threshold() {
        let c = compressor();
        assert!(!c.is_long_thread(&thread(30)));
        assert!(c.is_long_thread(&thread(31)));
    }
}
