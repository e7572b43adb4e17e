//! The agent loop: one user message in, a bounded run of model calls and tool
//! invocations, one reply out.

mod error;
mod events;
mod recovery;
mod streaming;
mod tool_execution;

pub use error::AgentError;
pub use events::{AgentEvent, AgentEventTx, TurnOutcome, TurnRequest, TurnStatus};
pub use recovery::recover_tool_call;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ember_llm::{ChatOptions, ChatResponse, LlmProvider, Message, ToolChoice};
use ember_memory::types::derive_title;
use ember_memory::{MemoryError, Playbook, ThreadId, ThreadStore};
use ember_tools::{SelectorConfig, ToolExecutor, ToolSelector};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::Instrument as _;

use crate::compaction::{CompactionMode, ContextCompressor, needs_compaction};
use crate::config::{CompactionConfig, Config};
use crate::context::{
    INTERRUPTED_RESULT, PromptParts, build_system_prompt, repair_tool_sequence, set_system_message,
};
use crate::reflection::spawn_reflection;
use crate::self_state::{Params, SelfStateKernel};

use self::streaming::emit;
use self::tool_execution::DoomLoopGuard;

const SLOW_MODEL_REPLY: &str = "The model is taking too long to respond right now. \
Please try again in a moment.";

const COMPACTED_REPLY: &str = "This conversation had grown too long for the model to answer \
in time, so I condensed the older messages. Please repeat your last request.";

const DOOM_LOOP_REPLY: &str = "I kept making the same tool calls without getting anywhere, \
so I stopped. Could you rephrase the request or give me more detail?";

const MAX_TURNS_REPLY: &str = "I ran out of steps for this request before finishing. \
Ask me to continue if you want me to keep going.";

const TITLE_PROMPT: &str = "Write a title of at most six words for a conversation that \
starts with the message below. Reply with the title only, no quotes.";

/// Per-process knobs for the loop. Per-turn limits (`max_turns`, temperature,
/// `compress_at`) come from the self-state instead.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub name: String,
    pub turn_timeout: Duration,
    pub max_tokens: u32,
    pub title_generation: bool,
    pub doom_loop_window: usize,
    pub stream: bool,
    pub playbook_inject_top: usize,
}

impl AgentSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.agent.name.clone(),
            turn_timeout: Duration::from_secs(config.agent.turn_timeout_secs),
            max_tokens: config.agent.max_tokens,
            title_generation: config.agent.title_generation,
            doom_loop_window: config.agent.doom_loop_window,
            stream: config.llm.stream,
            playbook_inject_top: config.playbook.inject_top,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What the model's reply asks the loop to do next.
enum Transition {
    Reply(ChatResponse),
    ToolCalls(ChatResponse),
    /// The reply had no structured calls but its text invoked a known tool.
    RecoveredToolCall(ChatResponse),
}

#[derive(Debug, Default)]
struct TurnStats {
    rounds: usize,
    tool_calls: usize,
    tool_errors: usize,
}

pub struct Agent<P> {
    provider: P,
    aux: P,
    store: Arc<ThreadStore>,
    kernel: Arc<SelfStateKernel>,
    executor: ToolExecutor,
    selector: ToolSelector,
    compressor: ContextCompressor,
    playbook: Option<Arc<Mutex<Playbook>>>,
    settings: AgentSettings,
    contexts: Mutex<HashMap<ThreadId, Vec<Message>>>,
}

impl<P: LlmProvider + Clone + 'static> Agent<P> {
    #[must_use]
    pub fn new(
        provider: P,
        store: Arc<ThreadStore>,
        kernel: Arc<SelfStateKernel>,
        executor: ToolExecutor,
    ) -> Self {
        Self {
            aux: provider.clone(),
            provider,
            store,
            kernel,
            executor,
            selector: ToolSelector::new(&SelectorConfig::default()),
            compressor: ContextCompressor::new(CompactionConfig::default()),
            playbook: None,
            settings: AgentSettings::default(),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Lighter model used for summaries, reflection and titles.
    #[must_use]
    pub fn with_aux(mut self, aux: P) -> Self {
        self.aux = aux;
        self
    }

    #[must_use]
    pub fn with_selector(mut self, config: &SelectorConfig) -> Self {
        self.selector = ToolSelector::new(config);
        self
    }

    #[must_use]
    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.compressor = ContextCompressor::new(config);
        self
    }

    #[must_use]
    pub fn with_playbook(mut self, playbook: Arc<Mutex<Playbook>>) -> Self {
        self.playbook = Some(playbook);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ThreadStore> {
        &self.store
    }

    #[must_use]
    pub fn kernel(&self) -> &Arc<SelfStateKernel> {
        &self.kernel
    }

    #[must_use]
    pub fn compressor(&self) -> &ContextCompressor {
        &self.compressor
    }

    /// The model-facing context of `thread`: the cached one, or the repaired on-disk log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read.
    pub async fn context(&self, thread: &ThreadId) -> Result<Vec<Message>, AgentError> {
        if let Some(ctx) = self.contexts.lock().await.get(thread) {
            return Ok(ctx.clone());
        }
        let log = match self.store.load(thread).await {
            Ok(messages) => messages,
            Err(MemoryError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(repair_tool_sequence(log))
    }

    /// Remove a thread from disk and from the context cache.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown thread.
    pub async fn delete_thread(&self, thread: &ThreadId) -> Result<(), AgentError> {
        self.contexts.lock().await.remove(thread);
        self.store.delete(thread).await?;
        Ok(())
    }

    /// Handle one user message end to end.
    ///
    /// Deadline overruns and transient endpoint failures do not fail the turn: they
    /// come back as [`TurnStatus::TimedOut`] with a user-facing reply.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-transient model failure or when the log cannot be written.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: Option<&AgentEventTx>,
    ) -> Result<TurnOutcome, AgentError> {
        let thread = request.thread.clone().unwrap_or_else(ThreadId::generate);
        let span = tracing::info_span!("turn", thread = %thread);
        self.turn(thread, request, events).instrument(span).await
    }

    async fn turn(
        &self,
        thread: ThreadId,
        request: TurnRequest,
        events: Option<&AgentEventTx>,
    ) -> Result<TurnOutcome, AgentError> {
        let deadline = Instant::now() + self.settings.turn_timeout;
        self.ensure_thread(&thread, &request.text).await?;

        let params = self.kernel.params().await;
        let mut ctx = self.context(&thread).await?;
        let injected = self.refresh_system_prompt(&mut ctx).await;

        if needs_compaction(&ctx, params.compress_at) {
            emit(events, AgentEvent::Status("compacting context".into()));
            self.compact(&mut ctx, CompactionMode::Normal, params.compress_at, deadline)
                .await;
        }

        let user = Message::user(request.text).with_attachments(request.attachments);
        self.store
            .append(&thread, std::slice::from_ref(&user))
            .await?;
        ctx.push(user);

        let mut stats = TurnStats::default();
        let result = self
            .run_rounds(&thread, &mut ctx, &params, deadline, events, &mut stats)
            .await;
        self.contexts
            .lock()
            .await
            .insert(thread.clone(), repair_tool_sequence(ctx));
        let (reply, status) = result?;

        if !matches!(status, TurnStatus::TimedOut { .. }) {
            self.record_playbook(&injected, stats.tool_errors == 0).await;
        }
        tracing::info!(
            ?status,
            rounds = stats.rounds,
            tool_calls = stats.tool_calls,
            tool_errors = stats.tool_errors,
            "turn finished"
        );
        Ok(TurnOutcome {
            thread,
            reply,
            status,
            tool_calls: stats.tool_calls,
            rounds: stats.rounds,
        })
    }

    async fn run_rounds(
        &self,
        thread: &ThreadId,
        ctx: &mut Vec<Message>,
        params: &Params,
        deadline: Instant,
        events: Option<&AgentEventTx>,
        stats: &mut TurnStats,
    ) -> Result<(String, TurnStatus), AgentError> {
        let known = self.executor.registry().names();
        let mut doom = DoomLoopGuard::new(self.settings.doom_loop_window);
        let mut last_text = String::new();

        for round in 1..=params.max_turns as usize {
            stats.rounds = round;
            let catalog = self.executor.registry().definitions();
            let tools = self.selector.select(&catalog, ctx);
            let options = ChatOptions {
                max_tokens: self.settings.max_tokens,
                temperature: params.temperature,
                tool_choice: if tools.is_empty() {
                    ToolChoice::None
                } else {
                    ToolChoice::Auto
                },
            };
            tracing::debug!(round, tools = tools.len(), messages = ctx.len(), "calling model");

            let mut partial = String::new();
            let result = tokio::time::timeout_at(
                deadline,
                self.complete(ctx, &tools, &options, events, &mut partial),
            )
            .await;
            let response = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) if e.is_transient() => {
                    return self
                        .interrupted(thread, ctx, partial, &e.to_string(), params, events)
                        .await;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return self
                        .interrupted(thread, ctx, partial, "turn deadline exceeded", params, events)
                        .await;
                }
            };

            let response = match classify(response, &known) {
                Transition::Reply(resp) => {
                    let reply = resp.content.clone();
                    self.commit(thread, ctx, vec![resp.into_message()]).await?;
                    return Ok((reply, TurnStatus::Completed));
                }
                Transition::ToolCalls(resp) => resp,
                Transition::RecoveredToolCall(resp) => {
                    let name = &resp.tool_calls[0].name;
                    tracing::info!(tool = %name, "recovered tool call from reply text");
                    emit(
                        events,
                        AgentEvent::Status(format!("recovered a {name} call from the reply text")),
                    );
                    resp
                }
            };

            if !response.content.trim().is_empty() {
                last_text.clone_from(&response.content);
            }
            let calls = response.tool_calls.clone();
            let Ok((results, errors)) = tokio::time::timeout_at(
                deadline,
                self.execute_calls(&calls, params.reflect_on_tools, events),
            )
            .await
            else {
                stats.tool_calls += calls.len();
                stats.tool_errors += calls.len();
                let mut batch = vec![response.into_message()];
                batch.extend(
                    calls
                        .iter()
                        .map(|c| Message::tool_result(c.id.clone(), INTERRUPTED_RESULT)),
                );
                self.commit(thread, ctx, batch).await?;
                return self
                    .interrupted(
                        thread,
                        ctx,
                        String::new(),
                        "turn deadline exceeded during tool execution",
                        params,
                        events,
                    )
                    .await;
            };
            stats.tool_calls += calls.len();
            stats.tool_errors += errors;

            let mut batch = Vec::with_capacity(results.len() + 1);
            batch.push(response.into_message());
            batch.extend(results);
            self.commit(thread, ctx, batch).await?;

            if doom.record(&calls) {
                tracing::warn!(
                    window = self.settings.doom_loop_window,
                    "identical tool rounds, stopping"
                );
                let reply = DOOM_LOOP_REPLY.to_owned();
                self.commit(thread, ctx, vec![Message::assistant(reply.clone())])
                    .await?;
                return Ok((reply, TurnStatus::DoomLoop));
            }
        }

        tracing::warn!(max_turns = params.max_turns, "turn hit the round limit");
        let reply = if last_text.is_empty() {
            MAX_TURNS_REPLY.to_owned()
        } else {
            format!("{last_text}\n\n{MAX_TURNS_REPLY}")
        };
        self.commit(thread, ctx, vec![Message::assistant(reply.clone())])
            .await?;
        Ok((reply, TurnStatus::MaxTurns))
    }

    /// Log first, then context, so the context never holds what the log lost.
    async fn commit(
        &self,
        thread: &ThreadId,
        ctx: &mut Vec<Message>,
        messages: Vec<Message>,
    ) -> Result<(), AgentError> {
        self.store.append(thread, &messages).await?;
        ctx.extend(messages);
        Ok(())
    }

    async fn interrupted(
        &self,
        thread: &ThreadId,
        ctx: &mut Vec<Message>,
        partial: String,
        cause: &str,
        params: &Params,
        events: Option<&AgentEventTx>,
    ) -> Result<(String, TurnStatus), AgentError> {
        tracing::warn!(cause, partial_chars = partial.len(), "turn interrupted");
        if !partial.trim().is_empty() {
            self.commit(thread, ctx, vec![Message::assistant(partial)])
                .await?;
        }

        if !self.compressor.is_long_thread(ctx) {
            return Ok((
                SLOW_MODEL_REPLY.to_owned(),
                TurnStatus::TimedOut { compacted: false },
            ));
        }

        emit(events, AgentEvent::Status("compacting context".into()));
        let limit = Instant::now() + self.settings.turn_timeout;
        let compacted = self
            .compact(ctx, CompactionMode::Forced, params.compress_at, limit)
            .await;
        let reply = if compacted {
            COMPACTED_REPLY
        } else {
            SLOW_MODEL_REPLY
        };
        Ok((reply.to_owned(), TurnStatus::TimedOut { compacted }))
    }

    /// Fold the old part of `ctx` into a summary, reflecting on what is dropped.
    /// Returns whether anything was folded before `limit`.
    async fn compact(
        &self,
        ctx: &mut Vec<Message>,
        mode: CompactionMode,
        compress_at: usize,
        limit: Instant,
    ) -> bool {
        let run = self.compressor.compact(&self.aux, ctx, mode, compress_at);
        let outcome = match tokio::time::timeout_at(limit, run).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return false,
            Err(_) => {
                tracing::warn!(?mode, "compaction timed out, context left as is");
                return false;
            }
        };
        if let Some(book) = &self.playbook {
            spawn_reflection(self.aux.clone(), Arc::clone(book), outcome.dropped);
        }
        *ctx = outcome.messages;
        true
    }

    async fn ensure_thread(&self, thread: &ThreadId, text: &str) -> Result<(), AgentError> {
        if self.store.exists(thread).await {
            return Ok(());
        }
        self.store.create(thread, &derive_title(text)).await?;
        if self.settings.title_generation && !text.trim().is_empty() {
            spawn_title(
                self.aux.clone(),
                Arc::clone(&self.store),
                thread.clone(),
                text.to_owned(),
            );
        }
        Ok(())
    }

    /// Rebuild the system message and return the ids of the playbook bullets it shows.
    async fn refresh_system_prompt(&self, ctx: &mut Vec<Message>) -> Vec<String> {
        let self_state = self.kernel.system_prompt().await;
        let n = self.settings.playbook_inject_top;
        let (playbook, injected) = match &self.playbook {
            Some(book) => {
                let book = book.lock().await;
                let ids = book.top(n).into_iter().map(|b| b.id.clone()).collect();
                (book.render(n), ids)
            }
            None => (None, Vec::new()),
        };
        let prompt = build_system_prompt(&PromptParts {
            self_state: &self_state,
            playbook: playbook.as_deref(),
            agent_name: Some(&self.settings.name),
        });
        set_system_message(ctx, prompt);
        injected
    }

    async fn record_playbook(&self, injected: &[String], success: bool) {
        let Some(book) = &self.playbook else {
            return;
        };
        if injected.is_empty() {
            return;
        }
        let mut book = book.lock().await;
        book.record_outcome(injected, success);
        if let Err(e) = book.save().await {
            tracing::warn!("failed to save playbook: {e}");
        }
    }
}

fn classify(mut response: ChatResponse, known: &[String]) -> Transition {
    if !response.tool_calls.is_empty() {
        return Transition::ToolCalls(response);
    }
    match recover_tool_call(&response.content, known) {
        Some(call) => {
            response.content.clear();
            response.tool_calls = vec![call];
            Transition::RecoveredToolCall(response)
        }
        None => Transition::Reply(response),
    }
}

fn spawn_title<P: LlmProvider + 'static>(
    aux: P,
    store: Arc<ThreadStore>,
    thread: ThreadId,
    text: String,
) {
    let span = tracing::debug_span!("title", thread = %thread);
    tokio::spawn(
        async move {
            let options = ChatOptions {
                max_tokens: 24,
                temperature: 0.3,
                tool_choice: ToolChoice::None,
            };
            let prompt = [Message::system(TITLE_PROMPT), Message::user(text)];
            let title = match aux.chat(&prompt, &[], &options).await {
                Ok(resp) => clean_title(&resp.content),
                Err(e) => {
                    tracing::debug!("title generation failed: {e}");
                    return;
                }
            };
            let Some(title) = title else {
                return;
            };
            if let Err(e) = store.set_title(&thread, &title).await {
                tracing::debug!("failed to store generated title: {e}");
            }
        }
        .instrument(span),
    );
}

/// First non-empty line without quotes or markdown decoration; `None` if nothing usable.
fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_start_matches(['#', '*', ' '])
        .trim_matches(['"', '\'', '*', '`', ' '])
        .trim_end_matches('.');
    let line = line.strip_prefix("Title:").map_or(line, str::trim);
    (!line.is_empty() && line.chars().count() <= 80).then(|| line.to_owned())
}
