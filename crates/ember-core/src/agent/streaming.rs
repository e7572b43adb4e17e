use ember_llm::{
    ChatOptions, ChatResponse, LlmError, LlmProvider, Message, StreamDelta, ToolDefinition,
};
use tokio::sync::mpsc;

use super::{Agent, AgentEvent, AgentEventTx};

pub(super) fn emit(events: Option<&AgentEventTx>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

impl<P: LlmProvider + Clone + 'static> Agent<P> {
    /// One model call with the retry policy applied: a transient failure is retried
    /// once, an empty reply is retried once without streaming.
    ///
    /// Content received so far is mirrored into `partial` so it survives cancellation.
    pub(super) async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        events: Option<&AgentEventTx>,
        partial: &mut String,
    ) -> Result<ChatResponse, LlmError> {
        let resp = match self.call_model(messages, tools, options, events, partial).await {
            Err(e) if e.is_transient() => {
                tracing::warn!("model call failed, retrying once: {e}");
                emit(events, AgentEvent::Status("retrying model call".into()));
                partial.clear();
                self.call_model(messages, tools, options, events, partial)
                    .await?
            }
            other => other?,
        };
        if !resp.is_empty() {
            return Ok(resp);
        }

        tracing::warn!("empty model reply, retrying without streaming");
        partial.clear();
        let resp = self.provider.chat(messages, tools, options).await?;
        forward_whole(&resp, events, partial);
        Ok(resp)
    }

    async fn call_model(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        events: Option<&AgentEventTx>,
        partial: &mut String,
    ) -> Result<ChatResponse, LlmError> {
        if !(self.settings.stream && self.provider.supports_streaming()) {
            let resp = self.provider.chat(messages, tools, options).await?;
            forward_whole(&resp, events, partial);
            return Ok(resp);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let call = self.provider.chat_stream(messages, tools, options, Some(&tx));
        tokio::pin!(call);
        let result = loop {
            tokio::select! {
                biased;
                Some(delta) = rx.recv() => forward(delta, events, partial),
                res = &mut call => break res,
            }
        };
        while let Ok(delta) = rx.try_recv() {
            forward(delta, events, partial);
        }

        let resp = result?;
        if resp.partial {
            tracing::warn!(chars = resp.content.len(), "stream ended early, using partial reply");
        }
        Ok(resp)
    }
}

fn forward(delta: StreamDelta, events: Option<&AgentEventTx>, partial: &mut String) {
    match delta {
        StreamDelta::Content(text) => {
            partial.push_str(&text);
            emit(events, AgentEvent::Content(text));
        }
        StreamDelta::Reasoning(text) => emit(events, AgentEvent::Reasoning(text)),
        StreamDelta::ToolCall { .. } => {}
    }
}

fn forward_whole(resp: &ChatResponse, events: Option<&AgentEventTx>, partial: &mut String) {
    if let Some(reasoning) = &resp.reasoning {
        emit(events, AgentEvent::Reasoning(reasoning.clone()));
    }
    if !resp.content.is_empty() {
        partial.push_str(&resp.content);
        emit(events, AgentEvent::Content(resp.content.clone()));
    }
}
