use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ember_llm::{LlmProvider, Message, ToolCall};

use super::streaming::emit;
use super::{Agent, AgentEvent, AgentEventTx};

const REFLECT_HINT: &str = "\n\nThe call failed. Before retrying, check the arguments \
against the tool's schema and the error above, or try a different approach.";

impl<P: LlmProvider + Clone + 'static> Agent<P> {
    /// Run `calls` one after another. Results come back in call order, with the
    /// number of failed calls.
    pub(super) async fn execute_calls(
        &self,
        calls: &[ToolCall],
        reflect: bool,
        events: Option<&AgentEventTx>,
    ) -> (Vec<Message>, usize) {
        let mut results = Vec::with_capacity(calls.len());
        let mut errors = 0;
        for call in calls {
            emit(
                events,
                AgentEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            );
            let result = self.executor.execute(&call.name, &call.arguments).await;
            let mut output = result.output;
            if result.is_error {
                errors += 1;
                if reflect {
                    output.push_str(REFLECT_HINT);
                }
            }
            emit(
                events,
                AgentEvent::ToolFinished {
                    id: call.id.clone(),
                    name: result.name,
                    output: output.clone(),
                    is_error: result.is_error,
                },
            );
            results.push(Message::tool_result(call.id.clone(), output));
        }
        (results, errors)
    }
}

/// Trips when the last `window` tool rounds were identical. Windows below 2 disable it.
#[derive(Debug)]
pub(super) struct DoomLoopGuard {
    window: usize,
    history: Vec<u64>,
}

impl DoomLoopGuard {
    pub(super) fn new(window: usize) -> Self {
        Self {
            window,
            history: Vec::new(),
        }
    }

    pub(super) fn record(&mut self, calls: &[ToolCall]) -> bool {
        self.history.push(signature(calls));
        if self.window < 2 || self.history.len() < self.window {
            return false;
        }
        let recent = &self.history[self.history.len() - self.window..];
        recent.windows(2).all(|w| w[0] == w[1])
    }
}

fn signature(calls: &[ToolCall]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for call in calls {
        call.name.hash(&mut hasher);
        call.arguments.hash(&mut hasher);
    }
    hasher.finish()
}
