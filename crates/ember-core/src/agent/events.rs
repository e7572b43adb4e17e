use ember_llm::Attachment;
use ember_memory::ThreadId;
use tokio::sync::mpsc;

/// Progress of a turn, delivered as it happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Content(String),
    Reasoning(String),
    ToolStarted {
        id: String,
        name: String,
        arguments: String,
    },
    ToolFinished {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    Status(String),
}

pub type AgentEventTx = mpsc::UnboundedSender<AgentEvent>;

/// One inbound user message. A missing `thread` starts a new conversation.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub thread: Option<ThreadId>,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl TurnRequest {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_thread(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// The round limit was hit while the model still wanted tools.
    MaxTurns,
    /// The same tool calls were issued in consecutive rounds.
    DoomLoop,
    /// The deadline passed or the endpoint kept failing. `compacted` tells whether the
    /// context was force-compacted and the user asked to repeat.
    TimedOut { compacted: bool },
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread: ThreadId,
    pub reply: String,
    pub status: TurnStatus,
    pub tool_calls: usize,
    pub rounds: usize,
}
