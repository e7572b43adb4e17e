//! Scripted provider for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::{
    ChatOptions, ChatResponse, DeltaTx, LlmProvider, Message, StreamDelta, ToolDefinition,
};

/// One scripted outcome, consumed in order.
#[derive(Debug, Clone)]
pub enum MockReply {
    Response(ChatResponse),
    /// Fails with a 503, which callers classify as transient.
    Transient,
    /// Fails with a non-transient error.
    Fatal(String),
    /// Sleeps before answering. Used to exceed turn deadlines.
    Delayed(u64, ChatResponse),
}

/// What the provider was asked.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub options: ChatOptions,
    pub streamed: bool,
}

#[derive(Debug, Clone)]
pub struct MockProvider {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    pub default_response: String,
    pub streaming: bool,
    pub fail_chat: bool,
    /// Milliseconds to sleep before every reply.
    pub delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            default_response: "mock response".into(),
            streaming: false,
            fail_chat: false,
            delay_ms: 0,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    /// Plain text replies.
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self::with_replies(
            responses
                .into_iter()
                .map(|r| MockReply::Response(ChatResponse::text(r)))
                .collect(),
        )
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn push(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    async fn next_reply(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        streamed: bool,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.lock().unwrap().push(RecordedCall {
            messages: messages.to_vec(),
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            options: *options,
            streamed,
        });
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            None => Ok(ChatResponse::text(self.default_response.clone())),
            Some(MockReply::Response(resp)) => Ok(resp),
            Some(MockReply::Transient) => Err(LlmError::Status {
                provider: "mock",
                status: 503,
                body: "mock unavailable".into(),
            }),
            Some(MockReply::Fatal(msg)) => Err(LlmError::Other(msg)),
            Some(MockReply::Delayed(ms, resp)) => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                Ok(resp)
            }
        }
    }
}

impl LlmProvider for MockProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.next_reply(messages, tools, options, false).await
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        options: &ChatOptions,
        tx: Option<&DeltaTx>,
    ) -> Result<ChatResponse, LlmError> {
        let resp = self.next_reply(messages, tools, options, true).await?;
        if let Some(tx) = tx {
            if let Some(reasoning) = &resp.reasoning {
                let _ = tx.send(StreamDelta::Reasoning(reasoning.clone()));
            }
            for word in resp.content.split_inclusive(' ') {
                let _ = tx.send(StreamDelta::Content(word.to_owned()));
            }
        }
        Ok(resp)
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }
}
