//! Lesson extraction from conversation spans about to be discarded.

use std::sync::Arc;

use ember_llm::{ChatOptions, LlmProvider, Message, ToolChoice};
use ember_memory::Playbook;
use ember_memory::playbook::{MergeReport, parse_reflection};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::compaction::render_transcript;

const REFLECTION_TRUNCATE_CHARS: usize = 600;

const REFLECTION_PROMPT: &str = "\
Read the conversation excerpt below and extract short, reusable lessons for future \
conversations. Reply with a JSON array only. Each element is an object with \
\"type\" (one of \"strategy\", \"pitfall\", \"tool_pattern\", \"preference\") and \
\"content\" (one sentence). Reply with [] when there is nothing worth keeping.";

/// Ask the model for lessons from `span` and merge them into the playbook.
///
/// # Errors
///
/// Returns an error if the model call or the playbook write fails.
pub async fn reflect<P: LlmProvider>(
    provider: &P,
    playbook: &Mutex<Playbook>,
    span: &[Message],
) -> Result<MergeReport, crate::agent::AgentError> {
    let refs: Vec<&Message> = span.iter().collect();
    let transcript = render_transcript(&refs, REFLECTION_TRUNCATE_CHARS);

    let options = ChatOptions {
        max_tokens: 512,
        temperature: 0.3,
        tool_choice: ToolChoice::None,
    };
    let resp = provider
        .chat(
            &[Message::system(REFLECTION_PROMPT), Message::user(transcript)],
            &[],
            &options,
        )
        .await?;

    let candidates = parse_reflection(&resp.content);
    if candidates.is_empty() {
        tracing::debug!("reflection produced no lessons");
        return Ok(MergeReport::default());
    }

    let mut book = playbook.lock().await;
    let report = book.merge(candidates);
    book.save().await?;
    tracing::info!(
        added = report.added,
        merged = report.merged,
        pruned = report.pruned,
        evicted = report.evicted,
        total = book.len(),
        "playbook updated"
    );
    Ok(report)
}

/// Fire-and-forget [`reflect`]. Failures are logged and never reach the turn.
pub fn spawn_reflection<P>(
    provider: P,
    playbook: Arc<Mutex<Playbook>>,
    span: Vec<Message>,
) -> JoinHandle<()>
where
    P: LlmProvider + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = reflect(&provider, &playbook, &span).await {
            tracing::warn!("reflection failed: {e:#}");
        }
    })
}
