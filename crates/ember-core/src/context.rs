//! Model-facing context: tool-sequence repair and system prompt assembly.

use std::collections::{HashMap, HashSet};

use ember_llm::{Message, Role};

/// Result text given to a tool call whose result never made it into the log.
pub const INTERRUPTED_RESULT: &str = "Error: tool call was interrupted before it returned a result";

/// Restore the call/result pairing the chat API requires.
///
/// Every assistant message with tool calls is followed by exactly one tool message per
/// call id in call order. Missing results are synthesized, duplicates and orphans dropped.
#[must_use]
pub fn repair_tool_sequence(messages: Vec<Message>) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();
    let mut synthesized = 0usize;
    let mut dropped = 0usize;

    while let Some(mut msg) = iter.next() {
        match msg.role {
            Role::Tool => {
                // not preceded by an assistant call block
                dropped += 1;
            }
            Role::Assistant if msg.has_tool_calls() => {
                let mut seen = HashSet::new();
                msg.tool_calls.retain(|c| seen.insert(c.id.clone()));

                let mut results: HashMap<String, Message> = HashMap::new();
                while iter.peek().is_some_and(|m| m.role == Role::Tool) {
                    let Some(result) = iter.next() else { break };
                    match result.tool_call_id.clone() {
                        Some(id) if seen.contains(&id) && !results.contains_key(&id) => {
                            results.insert(id, result);
                        }
                        _ => dropped += 1,
                    }
                }

                let ids: Vec<String> = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
                out.push(msg);
                for id in ids {
                    if let Some(result) = results.remove(&id) {
                        out.push(result);
                    } else {
                        synthesized += 1;
                        out.push(Message::tool_result(id, INTERRUPTED_RESULT));
                    }
                }
            }
            _ => out.push(msg),
        }
    }

    if synthesized > 0 || dropped > 0 {
        tracing::debug!(synthesized, dropped, "repaired tool call sequence");
    }
    out
}

/// Inputs for the system message sent on every model call.
#[derive(Debug, Default)]
pub struct PromptParts<'a> {
    /// Rendered self-state: prompt, active rules, language and verbosity directives.
    pub self_state: &'a str,
    pub playbook: Option<&'a str>,
    pub agent_name: Option<&'a str>,
}

#[must_use]
pub fn build_system_prompt(parts: &PromptParts<'_>) -> String {
    let mut prompt = parts.self_state.trim_end().to_owned();

    if let Some(name) = parts.agent_name.filter(|n| !n.is_empty()) {
        prompt.push_str("\n\nYour name is ");
        prompt.push_str(name);
        prompt.push('.');
    }

    if let Some(playbook) = parts.playbook.filter(|p| !p.is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(playbook.trim_end());
    }

    prompt.push_str("\n\nCurrent date: ");
    prompt.push_str(&chrono::Local::now().format("%Y-%m-%d").to_string());
    prompt
}

/// Put `system` at the head of the context, replacing a previous system message.
pub fn set_system_message(messages: &mut Vec<Message>, system: String) {
    match messages.first_mut() {
        Some(first) if first.role == Role::System => first.content = system,
        _ => messages.insert(0, Message::system(system)),
    }
}
