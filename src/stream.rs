//! Responses event stream → Chat Completions chunk stream.
//!
//! Upstream SSE events are parsed once into [`UpstreamEvent`]. All state
//! lives in [`StreamState`], whose [`StreamState::apply`] turns one event into
//! zero or more [`SseFrame`]s without doing any I/O. [`aggregate_stream`]
//! drives it one upstream event at a time, so dropping the output stream stops
//! upstream consumption.

use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{error, warn};

use crate::protocol::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkFunction, ChunkToolCall, FinishReason,
    Role,
};

/// One SSE event as delivered by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub event: Option<String>,
    pub data: Option<String>,
}

impl RawEvent {
    pub fn new(event: Option<&str>, data: impl Into<String>) -> Self {
        Self {
            event: event.map(String::from),
            data: Some(data.into()),
        }
    }
}

impl From<eventsource_stream::Event> for RawEvent {
    fn from(event: eventsource_stream::Event) -> Self {
        // The SSE default event name carries no type information
        let name = match event.event.as_str() {
            "" | "message" => None,
            _ => Some(event.event),
        };
        Self {
            event: name,
            data: Some(event.data),
        }
    }
}

/// Decode an SSE byte stream into [`RawEvent`]s. Fields split across byte
/// chunks and multi-line `data:` fields are joined by the decoder.
pub fn decode_events<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<RawEvent, EventStreamError<E>>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    byte_stream
        .eventsource()
        .map(|event| event.map(RawEvent::from))
}

/// Upstream lifecycle events the aggregator reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Empty payload or the `[DONE]` sentinel
    End,
    /// Payload that is not valid JSON for any known event
    Malformed(String),
    /// `response.created` / `response.in_progress`
    Started {
        id: Option<String>,
        model: Option<String>,
    },
    /// `response.completed` / `response.done`
    Completed,
    ReasoningDelta(String),
    TextDelta(String),
    ArgumentsDelta(String),
    /// `response.output_item.added` for a function call
    ToolCallAdded { call_id: String, name: String },
    /// `response.output_item.done`
    ItemDone { item_type: String },
    Ignored,
}

#[derive(Debug, Default, Deserialize)]
struct EventPayload {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    response: Option<ResponseRef>,
    #[serde(default)]
    item: Option<ItemRef>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ItemRef {
    #[serde(rename = "type", default)]
    item_type: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl UpstreamEvent {
    pub fn parse(raw: &RawEvent) -> Self {
        let data = raw.data.as_deref().map(str::trim).unwrap_or_default();
        if data.is_empty() || data == "[DONE]" {
            return UpstreamEvent::End;
        }

        let payload: EventPayload = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(e) => return UpstreamEvent::Malformed(e.to_string()),
        };

        let tag = raw.event.as_deref();
        let payload_type = payload.event_type.as_deref();
        let is = |kinds: &[&str]| {
            kinds
                .iter()
                .any(|kind| tag == Some(*kind) || payload_type == Some(*kind))
        };

        if is(&["response.created", "response.in_progress"]) {
            let response = payload.response.unwrap_or_default();
            return UpstreamEvent::Started {
                id: response.id,
                model: response.model,
            };
        }
        if is(&["response.completed", "response.done"]) {
            return UpstreamEvent::Completed;
        }
        if is(&[
            "response.reasoning_summary_text.delta",
            "response.reasoning_text.delta",
        ]) {
            return delta_event(payload.delta, UpstreamEvent::ReasoningDelta);
        }
        if is(&["response.output_text.delta"]) {
            return delta_event(payload.delta, UpstreamEvent::TextDelta);
        }
        if is(&["response.function_call_arguments.delta"]) {
            return delta_event(payload.delta, UpstreamEvent::ArgumentsDelta);
        }
        if is(&["response.output_item.added"]) {
            let item = payload.item.unwrap_or_default();
            if item.item_type.as_deref() != Some("function_call") {
                return UpstreamEvent::Ignored;
            }
            return UpstreamEvent::ToolCallAdded {
                call_id: item.call_id.or(item.id).unwrap_or_default(),
                name: item.name.unwrap_or_default(),
            };
        }
        if is(&["response.output_item.done"]) {
            let item = payload.item.unwrap_or_default();
            return UpstreamEvent::ItemDone {
                item_type: item.item_type.unwrap_or_default(),
            };
        }
        if is(&["response.failed", "response.incomplete", "error"]) {
            warn!(event = ?tag.or(payload_type), payload = data, "upstream reported a failure");
        }

        UpstreamEvent::Ignored
    }
}

fn delta_event(delta: Option<String>, wrap: fn(String) -> UpstreamEvent) -> UpstreamEvent {
    match delta {
        Some(delta) if !delta.is_empty() => wrap(delta),
        _ => UpstreamEvent::Ignored,
    }
}

/// One downstream SSE `data:` payload
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Chunk(ChatCompletionChunk),
    /// The literal `[DONE]` sentinel
    Done,
}

/// Output of a single transition
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub frames: Vec<SseFrame>,
    /// Nothing more may be emitted or consumed
    pub finished: bool,
}

impl Step {
    fn done() -> Self {
        Self {
            frames: vec![SseFrame::Done],
            finished: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallAccumulator {
    pub index: usize,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

/// Per-request aggregation state
#[derive(Debug)]
pub struct StreamState {
    id: Option<String>,
    fallback_id: String,
    model: Option<String>,
    created: u64,
    role_sent: bool,
    tool_calls: Vec<ToolCallAccumulator>,
}

impl StreamState {
    /// `model` is the name reported to the client; upstream only fills it in
    /// when it is empty.
    pub fn new(model: &str) -> Self {
        Self {
            id: None,
            fallback_id: format!("chatcmpl-{}", uuid_simple()),
            model: (!model.is_empty()).then(|| model.to_string()),
            created: unix_now(),
            role_sent: false,
            tool_calls: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.fallback_id)
    }

    pub fn tool_calls(&self) -> &[ToolCallAccumulator] {
        &self.tool_calls
    }

    /// Advance the state machine by one upstream event
    pub fn apply(&mut self, event: UpstreamEvent) -> Step {
        let mut step = Step::default();
        match event {
            UpstreamEvent::End | UpstreamEvent::Completed => return Step::done(),
            UpstreamEvent::Malformed(_) | UpstreamEvent::Ignored => {}
            UpstreamEvent::Started { id, model } => {
                if self.id.is_none() {
                    self.id = id;
                }
                if self.model.is_none() {
                    self.model = model;
                }
            }
            UpstreamEvent::ReasoningDelta(text) => {
                self.announce_role(&mut step.frames);
                step.frames.push(self.chunk(
                    ChunkDelta {
                        reasoning_content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            UpstreamEvent::TextDelta(text) => {
                self.announce_role(&mut step.frames);
                step.frames.push(self.chunk(
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            UpstreamEvent::ArgumentsDelta(fragment) => {
                if self.tool_calls.is_empty() {
                    self.tool_calls.push(ToolCallAccumulator {
                        index: 0,
                        call_id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                    });
                }
                let Some(call) = self.tool_calls.last_mut() else {
                    return step;
                };
                call.arguments.push_str(&fragment);
                let index = call.index;

                self.announce_role(&mut step.frames);
                step.frames.push(self.tool_call_chunk(ChunkToolCall {
                    index,
                    id: None,
                    call_type: None,
                    function: ChunkFunction {
                        name: None,
                        arguments: fragment,
                    },
                }));
            }
            UpstreamEvent::ToolCallAdded { call_id, name } => {
                let index = self.tool_calls.len();
                self.tool_calls.push(ToolCallAccumulator {
                    index,
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                });

                self.announce_role(&mut step.frames);
                step.frames.push(self.tool_call_chunk(ChunkToolCall {
                    index,
                    id: Some(call_id),
                    call_type: Some("function".to_string()),
                    function: ChunkFunction {
                        name: Some(name),
                        arguments: String::new(),
                    },
                }));
            }
            UpstreamEvent::ItemDone { item_type } => {
                let reason = match item_type.as_str() {
                    "message" => Some(FinishReason::Stop),
                    "function_call" => Some(FinishReason::ToolCalls),
                    _ => None,
                };
                if let Some(reason) = reason {
                    step.frames
                        .push(self.chunk(ChunkDelta::default(), Some(reason)));
                }
            }
        }
        step
    }

    fn announce_role(&mut self, frames: &mut Vec<SseFrame>) {
        if self.role_sent {
            return;
        }
        self.role_sent = true;
        frames.push(self.chunk(
            ChunkDelta {
                role: Some(Role::Assistant),
                content: Some(String::new()),
                ..ChunkDelta::default()
            },
            None,
        ));
    }

    fn tool_call_chunk(&self, call: ChunkToolCall) -> SseFrame {
        self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![call]),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> SseFrame {
        SseFrame::Chunk(ChatCompletionChunk {
            id: self.id().to_string(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone().unwrap_or_default(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
                logprobs: None,
            }],
        })
    }
}

/// Turn an upstream event stream into Chat Completions frames. Always ends
/// with exactly one [`SseFrame::Done`], even when upstream closes or fails
/// before a terminal event.
pub fn aggregate_stream<S, E>(upstream: S, model: String) -> impl Stream<Item = SseFrame>
where
    S: Stream<Item = Result<RawEvent, E>>,
    E: Display,
{
    async_stream::stream! {
        let mut state = StreamState::new(&model);
        let mut finished = false;

        futures::pin_mut!(upstream);

        while let Some(item) = upstream.next().await {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => {
                    error!(error = %e, "upstream stream failed");
                    break;
                }
            };

            let event = UpstreamEvent::parse(&raw);
            if let UpstreamEvent::Malformed(reason) = &event {
                warn!(event = ?raw.event, %reason, "skipping malformed upstream event");
            }

            let step = state.apply(event);
            for frame in step.frames {
                yield frame;
            }
            if step.finished {
                finished = true;
                break;
            }
        }

        if !finished {
            yield SseFrame::Done;
        }
    }
}

/// Drive [`aggregate_stream`] into `sink`, one frame per upstream pull.
/// Stops at the first failed send without reading further upstream.
pub async fn aggregate_into<S, E, K>(upstream: S, model: String, mut sink: K) -> Result<(), K::Error>
where
    S: Stream<Item = Result<RawEvent, E>>,
    E: Display,
    K: Sink<SseFrame> + Unpin,
{
    let frames = aggregate_stream(upstream, model);
    futures::pin_mut!(frames);

    while let Some(frame) = frames.next().await {
        sink.send(frame).await?;
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Simple UUID-like string generator
fn uuid_simple() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:x}{:x}", now.as_secs(), now.subsec_nanos())
}
