//! Server-sent-event decoding for OpenAI-compatible chat streams.
//!
//! Three output channels are produced incrementally: plain content, reasoning and
//! tool-call fragments. Some backends put `<think>` markers inside the ordinary content
//! field, possibly split across frames, so content is routed through [`ThinkSplitter`]
//! which only releases text it can prove is not part of a marker.

use std::collections::BTreeMap;

use eventsource_stream::Eventsource;
use futures_core::Stream;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::provider::{ChatResponse, DeltaTx, StreamDelta, ToolCall};

pub const DONE_MARKER: &str = "[DONE]";
pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Span {
    Content(String),
    Reasoning(String),
}

/// Incremental `<think>` / `</think>` splitter.
///
/// The buffer holds back exactly the longest suffix that is a proper prefix of the
/// marker currently sought. The inside flag flips only on a complete marker.
#[derive(Debug, Default)]
pub struct ThinkSplitter {
    buf: String,
    inside: bool,
}

impl ThinkSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_inside(&self) -> bool {
        self.inside
    }

    pub fn push(&mut self, text: &str) -> Vec<Span> {
        self.buf.push_str(text);
        let mut out = Vec::new();
        loop {
            let marker = if self.inside { THINK_CLOSE } else { THINK_OPEN };
            if let Some(pos) = self.buf.find(marker) {
                let before: String = self.buf.drain(..pos).collect();
                self.buf.drain(..marker.len());
                self.emit(before, &mut out);
                self.inside = !self.inside;
                continue;
            }
            let release = self.buf.len() - held_suffix_len(&self.buf, marker);
            let ready: String = self.buf.drain(..release).collect();
            self.emit(ready, &mut out);
            return out;
        }
    }

    /// Release whatever is still held back to the active channel.
    pub fn finish(&mut self) -> Option<Span> {
        let rest = std::mem::take(&mut self.buf);
        let mut out = Vec::with_capacity(1);
        self.emit(rest, &mut out);
        out.pop()
    }

    fn emit(&self, text: String, out: &mut Vec<Span>) {
        if text.is_empty() {
            return;
        }
        out.push(if self.inside {
            Span::Reasoning(text)
        } else {
            Span::Content(text)
        });
    }
}

fn held_suffix_len(buf: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| buf.ends_with(&marker[..k]))
        .unwrap_or(0)
}

/// Split a complete text into `(content, reasoning)` using the same marker rules as the
/// streaming path.
#[must_use]
pub fn split_think(text: &str) -> (String, String) {
    let mut splitter = ThinkSplitter::new();
    let mut content = String::new();
    let mut reasoning = String::new();
    for span in splitter.push(text).into_iter().chain(splitter.finish()) {
        match span {
            Span::Content(s) => content.push_str(&s),
            Span::Reasoning(s) => reasoning.push_str(&s),
        }
    }
    (content, reasoning)
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Accumulates decoded frames into a [`ChatResponse`], forwarding deltas as they arrive.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    splitter: ThinkSplitter,
    content: String,
    reasoning: String,
    calls: BTreeMap<usize, PartialCall>,
    finish_reason: Option<String>,
    done: bool,
    partial: bool,
}

impl StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed the data of one SSE event. Multiple newline-separated JSON frames in one
    /// event are processed in order; malformed frames are skipped.
    pub fn push_data(&mut self, data: &str, tx: Option<&DeltaTx>) {
        for line in data.lines() {
            if self.done {
                return;
            }
            let line = line.trim();
            let line = line.strip_prefix("data:").map_or(line, str::trim_start);
            if line.is_empty() {
                continue;
            }
            if line == DONE_MARKER {
                self.done = true;
                return;
            }
            match serde_json::from_str::<StreamChunk>(line) {
                Ok(chunk) => self.apply(chunk, tx),
                Err(e) => tracing::warn!("skipping malformed stream frame: {e}"),
            }
        }
    }

    fn apply(&mut self, chunk: StreamChunk, tx: Option<&DeltaTx>) {
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            let delta = choice.delta;
            for text in [delta.reasoning_content, delta.reasoning]
                .into_iter()
                .flatten()
            {
                self.route(Span::Reasoning(text), tx);
            }
            if let Some(text) = delta.content
                && !text.is_empty()
            {
                for span in self.splitter.push(&text) {
                    self.route(span, tx);
                }
            }
            for frag in delta.tool_calls {
                self.push_tool_fragment(frag, tx);
            }
        }
    }

    fn push_tool_fragment(&mut self, frag: ToolCallChunk, tx: Option<&DeltaTx>) {
        let (name, arguments) = frag
            .function
            .map(|f| (f.name, f.arguments.unwrap_or_default()))
            .unwrap_or_default();
        let entry = self.calls.entry(frag.index).or_default();
        if entry.id.is_none()
            && let Some(id) = frag.id.as_ref().filter(|id| !id.is_empty())
        {
            entry.id = Some(id.clone());
        }
        if entry.name.is_none()
            && let Some(n) = name.as_ref().filter(|n| !n.is_empty())
        {
            entry.name = Some(n.clone());
        }
        entry.arguments.push_str(&arguments);
        if let Some(tx) = tx {
            let _ = tx.send(StreamDelta::ToolCall {
                index: frag.index,
                id: frag.id,
                name,
                arguments,
            });
        }
    }

    fn route(&mut self, span: Span, tx: Option<&DeltaTx>) {
        match span {
            Span::Content(text) => {
                self.content.push_str(&text);
                if let Some(tx) = tx {
                    let _ = tx.send(StreamDelta::Content(text));
                }
            }
            Span::Reasoning(text) => {
                if text.is_empty() {
                    return;
                }
                self.reasoning.push_str(&text);
                if let Some(tx) = tx {
                    let _ = tx.send(StreamDelta::Reasoning(text));
                }
            }
        }
    }

    pub fn mark_partial(&mut self) {
        self.partial = true;
    }

    /// Flush held-back text and assemble the response. Calls without an id get
    /// `call_<index>`; calls without a name are dropped.
    #[must_use]
    pub fn finish(mut self, tx: Option<&DeltaTx>) -> ChatResponse {
        if let Some(span) = self.splitter.finish() {
            self.route(span, tx);
        }
        let tool_calls = std::mem::take(&mut self.calls)
            .into_iter()
            .filter_map(|(index, call)| {
                let Some(name) = call.name else {
                    tracing::warn!(index, "dropping streamed tool call without a name");
                    return None;
                };
                Some(ToolCall {
                    id: call.id.unwrap_or_else(|| format!("call_{index}")),
                    name,
                    arguments: call.arguments,
                })
            })
            .collect();
        ChatResponse {
            content: self.content,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls,
            finish_reason: self.finish_reason,
            partial: self.partial,
        }
    }
}

/// Decode a raw SSE byte stream to completion.
///
/// A read error ends decoding early: the accumulated output is returned with
/// `partial = true` instead of being discarded.
pub async fn decode_event_stream<S, B, E>(stream: S, tx: Option<&DeltaTx>) -> ChatResponse
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut decoder = StreamDecoder::new();
    let mut events = std::pin::pin!(stream.eventsource());
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                decoder.push_data(&event.data, tx);
                if decoder.is_done() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("stream read failed, keeping partial output: {e}");
                decoder.mark_partial();
                break;
            }
        }
    }
    decoder.finish(tx)
}

/// Decode a streaming HTTP response body.
pub(crate) async fn decode_response(
    response: reqwest::Response,
    tx: Option<&DeltaTx>,
) -> ChatResponse {
    decode_event_stream(response.bytes_stream(), tx).await
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDeltaBody,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct StreamDeltaBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallChunk>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionChunk>,
}

#[derive(Deserialize)]
struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
