use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::UpstreamStreamChunk;
use crate::provider::classify_transport_error;
use crate::state::InflightGuard;
use crate::translate::map_finish_reason;

/// Reassembles upstream chat-completion chunks into Messages stream
/// events. The invariant it protects: at most one content block is open
/// at any time, every opened block is closed, and frames go out in the
/// order `message_start`, block events, `message_delta`, `message_stop`.
pub struct Reassembler {
    requested_model: String,
    started: bool,
    open: OpenBlock,
    next_index: u32,
    tools: HashMap<u32, ToolSlot>,
    stop_reason: Option<&'static str>,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    done: bool,
}

#[derive(Clone, Copy)]
enum OpenBlock {
    None,
    Text { index: u32 },
    Tool { index: u32, call: u32 },
}

/// Per-upstream-call accumulation. A tool block opens only once both the
/// id and name have arrived; argument fragments seen before that are
/// buffered and flushed as the first delta.
#[derive(Default)]
struct ToolSlot {
    id: Option<String>,
    name: Option<String>,
    pending_args: String,
    opened: bool,
    closed: bool,
}

impl Reassembler {
    pub fn new(requested_model: String) -> Self {
        Self {
            requested_model,
            started: false,
            open: OpenBlock::None,
            next_index: 0,
            tools: HashMap::new(),
            stop_reason: None,
            input_tokens: None,
            output_tokens: None,
            done: false,
        }
    }

    /// Whether the upstream ever declared the message complete. A raw
    /// EOF before this is true is an aborted generation, not a finish.
    pub fn saw_finish_reason(&self) -> bool {
        self.stop_reason.is_some()
    }

    /// Translates one parsed upstream chunk into zero or more SSE frames.
    pub fn handle_chunk(&mut self, chunk: UpstreamStreamChunk) -> Result<Vec<String>, AppError> {
        let mut frames = Vec::new();
        if self.done {
            return Ok(frames);
        }

        if let Some(usage) = chunk.usage {
            self.input_tokens = Some(usage.prompt_tokens);
            self.output_tokens = Some(usage.completion_tokens);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(frames);
        };

        if !self.started {
            self.started = true;
            let id = chunk.id.unwrap_or_else(|| "msg_stream".to_string());
            frames.push(message_start(&id, &self.requested_model));
        }

        if let Some(text) = choice.delta.content
            && !text.is_empty()
        {
            if !matches!(self.open, OpenBlock::Text { .. }) {
                self.close_open_block(&mut frames);
                frames.push(content_block_start_text(self.next_index));
                self.open = OpenBlock::Text {
                    index: self.next_index,
                };
                self.next_index += 1;
            }
            if let OpenBlock::Text { index } = self.open {
                frames.push(text_delta(index, &text));
            }
        }

        for call in choice.delta.tool_calls.unwrap_or_default() {
            let slot = self.tools.entry(call.index).or_default();
            if slot.closed {
                return Err(AppError::upstream_protocol(format!(
                    "tool call {} received a fragment after its block closed",
                    call.index
                )));
            }
            if let Some(id) = call.id {
                slot.id.get_or_insert(id);
            }
            if let Some(function) = call.function {
                if let Some(name) = function.name {
                    slot.name.get_or_insert(name);
                }
                if let Some(arguments) = function.arguments {
                    slot.pending_args.push_str(&arguments);
                }
            }

            if !slot.opened {
                let (Some(id), Some(name)) = (slot.id.clone(), slot.name.clone()) else {
                    continue;
                };
                self.close_open_block(&mut frames);
                let index = self.next_index;
                self.next_index += 1;
                self.open = OpenBlock::Tool {
                    index,
                    call: call.index,
                };
                frames.push(content_block_start_tool(index, &id, &name));
                if let Some(slot) = self.tools.get_mut(&call.index) {
                    slot.opened = true;
                    let buffered = std::mem::take(&mut slot.pending_args);
                    if !buffered.is_empty() {
                        frames.push(input_json_delta(index, &buffered));
                    }
                }
            } else if let OpenBlock::Tool { index, call: open } = self.open
                && open == call.index
            {
                let slot = self.tools.entry(call.index).or_default();
                let fragment = std::mem::take(&mut slot.pending_args);
                if !fragment.is_empty() {
                    frames.push(input_json_delta(index, &fragment));
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.close_open_block(&mut frames);
            if self.stop_reason.is_none() {
                self.stop_reason = Some(map_finish_reason(Some(&reason)));
            }
        }

        Ok(frames)
    }

    /// Closes the stream cleanly: any open block is stopped, then the
    /// terminal `message_delta` and `message_stop` frames go out. Safe to
    /// call after an upstream that never sent a finish reason.
    pub fn finish(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if self.done {
            return frames;
        }
        self.done = true;
        if !self.started {
            frames.push(message_start("msg_stream", &self.requested_model));
        }
        self.close_open_block(&mut frames);
        frames.push(message_delta(
            self.stop_reason.unwrap_or("end_turn"),
            self.output_tokens.unwrap_or(0),
            self.input_tokens,
        ));
        frames.push(message_stop());
        frames
    }

    /// Terminates the stream with an in-band error event. No further
    /// frames follow.
    pub fn abort(&mut self, error: &AppError) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![error_frame(error)]
    }

    fn close_open_block(&mut self, frames: &mut Vec<String>) {
        match std::mem::replace(&mut self.open, OpenBlock::None) {
            OpenBlock::None => {}
            OpenBlock::Text { index } => frames.push(content_block_stop(index)),
            OpenBlock::Tool { index, call } => {
                if let Some(slot) = self.tools.get_mut(&call) {
                    slot.closed = true;
                }
                frames.push(content_block_stop(index));
            }
        }
    }
}

/// Drives the upstream byte stream through the reassembler into an SSE
/// response body. Frames flow through a bounded channel so a slow client
/// applies backpressure to the upstream read; dropping the upstream
/// response on client disconnect cancels the provider call.
pub fn stream_response(
    upstream: reqwest::Response,
    requested_model: String,
    idle_timeout: Duration,
    inflight: InflightGuard,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);

    tokio::spawn(async move {
        // Held for the lifetime of the stream, not just the handler.
        let _inflight = inflight;
        let mut reassembler = Reassembler::new(requested_model);
        let mut bytes = upstream.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let next = tokio::time::timeout(idle_timeout, bytes.next()).await;
            let chunk = match next {
                Err(_) => {
                    let err = AppError::upstream_timeout(format!(
                        "no upstream data for {}ms",
                        idle_timeout.as_millis()
                    ));
                    warn!(error = %err, "stream idle timeout");
                    emit_all(&tx, reassembler.abort(&err)).await;
                    return;
                }
                Ok(None) => {
                    // A graceful TCP close is only a completion if the
                    // upstream declared one; otherwise the generation was
                    // cut off and the client must not mistake it for done.
                    if reassembler.saw_finish_reason() {
                        emit_all(&tx, reassembler.finish()).await;
                    } else {
                        let err = AppError::upstream_protocol(
                            "upstream closed the stream without completing the message",
                        );
                        warn!(error = %err, "stream ended prematurely");
                        emit_all(&tx, reassembler.abort(&err)).await;
                    }
                    return;
                }
                Ok(Some(Err(e))) => {
                    let err = classify_transport_error(&e);
                    warn!(error = %err, "upstream stream failed");
                    emit_all(&tx, reassembler.abort(&err)).await;
                    return;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\n', '\r']);
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload == "[DONE]" {
                    emit_all(&tx, reassembler.finish()).await;
                    return;
                }
                match serde_json::from_str::<UpstreamStreamChunk>(payload) {
                    Ok(parsed) => match reassembler.handle_chunk(parsed) {
                        Ok(frames) => {
                            if !emit_all(&tx, frames).await {
                                debug!("client disconnected, dropping upstream stream");
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "stream reassembly failed");
                            emit_all(&tx, reassembler.abort(&err)).await;
                            return;
                        }
                    },
                    Err(e) => {
                        let err = AppError::upstream_protocol(format!(
                            "upstream sent an undecodable stream chunk: {}",
                            e
                        ));
                        warn!(error = %err, "stream decode failed");
                        emit_all(&tx, reassembler.abort(&err)).await;
                        return;
                    }
                }
            }
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn emit_all(tx: &mpsc::Sender<Result<Bytes, Infallible>>, frames: Vec<String>) -> bool {
    for frame in frames {
        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
            return false;
        }
    }
    true
}

fn frame(event: &str, data: serde_json::Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

fn message_start(id: &str, model: &str) -> String {
    frame(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": 0, "output_tokens": 0}
            }
        }),
    )
}

fn content_block_start_text(index: u32) -> String {
    frame(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {"type": "text", "text": ""}
        }),
    )
}

fn content_block_start_tool(index: u32, id: &str, name: &str) -> String {
    frame(
        "content_block_start",
        json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
        }),
    )
}

fn text_delta(index: u32, text: &str) -> String {
    frame(
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "text_delta", "text": text}
        }),
    )
}

fn input_json_delta(index: u32, partial_json: &str) -> String {
    frame(
        "content_block_delta",
        json!({
            "type": "content_block_delta",
            "index": index,
            "delta": {"type": "input_json_delta", "partial_json": partial_json}
        }),
    )
}

fn content_block_stop(index: u32) -> String {
    frame(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": index}),
    )
}

fn message_delta(stop_reason: &str, output_tokens: u32, input_tokens: Option<u32>) -> String {
    let mut usage = json!({"output_tokens": output_tokens});
    if let Some(input_tokens) = input_tokens {
        usage["input_tokens"] = json!(input_tokens);
    }
    frame(
        "message_delta",
        json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason, "stop_sequence": null},
            "usage": usage
        }),
    )
}

fn message_stop() -> String {
    frame("message_stop", json!({"type": "message_stop"}))
}

fn error_frame(error: &AppError) -> String {
    frame(
        "error",
        json!({
            "type": "error",
            "error": {"type": error.kind.wire_type(), "message": error.message}
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        UpstreamFunctionCallDelta, UpstreamStreamChoice, UpstreamStreamDelta, UpstreamToolCallDelta,
        UpstreamUsage,
    };

    fn text_chunk(text: &str) -> UpstreamStreamChunk {
        UpstreamStreamChunk {
            id: Some("chatcmpl-1".to_string()),
            model: Some("gpt-x".to_string()),
            choices: vec![UpstreamStreamChoice {
                index: 0,
                delta: UpstreamStreamDelta {
                    role: None,
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn finish_chunk(reason: &str) -> UpstreamStreamChunk {
        UpstreamStreamChunk {
            id: Some("chatcmpl-1".to_string()),
            model: None,
            choices: vec![UpstreamStreamChoice {
                index: 0,
                delta: UpstreamStreamDelta::default(),
                finish_reason: Some(reason.to_string()),
            }],
            usage: None,
        }
    }

    fn tool_chunk(
        call_index: u32,
        id: Option<&str>,
        name: Option<&str>,
        args: Option<&str>,
    ) -> UpstreamStreamChunk {
        UpstreamStreamChunk {
            id: Some("chatcmpl-1".to_string()),
            model: None,
            choices: vec![UpstreamStreamChoice {
                index: 0,
                delta: UpstreamStreamDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![UpstreamToolCallDelta {
                        index: call_index,
                        id: id.map(str::to_string),
                        call_type: Some("function".to_string()),
                        function: Some(UpstreamFunctionCallDelta {
                            name: name.map(str::to_string),
                            arguments: args.map(str::to_string),
                        }),
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn event_names(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                f.lines()
                    .next()
                    .and_then(|l| l.strip_prefix("event: "))
                    .unwrap_or("")
                    .to_string()
            })
            .collect()
    }

    fn data_of(frame: &str) -> serde_json::Value {
        let line = frame
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .expect("data line");
        serde_json::from_str(line).expect("frame data is json")
    }

    #[test]
    fn text_stream_produces_the_canonical_frame_order() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        let mut frames = Vec::new();
        frames.extend(r.handle_chunk(text_chunk("Hel")).expect("ok"));
        frames.extend(r.handle_chunk(text_chunk("lo")).expect("ok"));
        frames.extend(r.handle_chunk(finish_chunk("stop")).expect("ok"));
        frames.extend(
            r.handle_chunk(UpstreamStreamChunk {
                id: None,
                model: None,
                choices: vec![],
                usage: Some(UpstreamUsage {
                    prompt_tokens: 12,
                    completion_tokens: 5,
                }),
            })
            .expect("usage chunk"),
        );
        frames.extend(r.finish());

        assert_eq!(
            event_names(&frames),
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let start = data_of(&frames[0]);
        assert_eq!(start["message"]["model"], "claude-sonnet");
        let delta = data_of(&frames[5]);
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["output_tokens"], 5);
        assert_eq!(delta["usage"]["input_tokens"], 12);
    }

    #[test]
    fn only_a_finish_reason_marks_the_message_complete() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        r.handle_chunk(text_chunk("partial")).expect("ok");
        assert!(!r.saw_finish_reason());
        r.handle_chunk(finish_chunk("stop")).expect("ok");
        assert!(r.saw_finish_reason());
    }

    #[test]
    fn usage_is_omitted_from_message_delta_until_reported() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        r.handle_chunk(text_chunk("hi")).expect("ok");
        r.handle_chunk(finish_chunk("stop")).expect("ok");
        let frames = r.finish();
        let delta = data_of(&frames[1]);
        assert_eq!(delta["usage"]["output_tokens"], 0);
        assert!(delta["usage"].get("input_tokens").is_none());
    }

    #[test]
    fn tool_block_waits_for_id_and_name_then_flushes_buffered_args() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        // Arguments arrive before the name; nothing may open yet.
        let first = r
            .handle_chunk(tool_chunk(0, Some("call_1"), None, Some("{\"q\"")))
            .expect("ok");
        assert_eq!(event_names(&first), ["message_start"]);

        let second = r
            .handle_chunk(tool_chunk(0, None, Some("search"), Some(":\"rust\"}")))
            .expect("ok");
        assert_eq!(
            event_names(&second),
            ["content_block_start", "content_block_delta"]
        );
        let start = data_of(&second[0]);
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["content_block"]["name"], "search");
        let delta = data_of(&second[1]);
        assert_eq!(delta["delta"]["partial_json"], "{\"q\":\"rust\"}");

        let mut tail = Vec::new();
        tail.extend(r.handle_chunk(finish_chunk("tool_calls")).expect("ok"));
        tail.extend(r.finish());
        assert_eq!(
            event_names(&tail),
            ["content_block_stop", "message_delta", "message_stop"]
        );
        assert_eq!(data_of(&tail[1])["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn a_new_block_force_closes_the_previous_one() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        r.handle_chunk(text_chunk("thinking")).expect("ok");
        let frames = r
            .handle_chunk(tool_chunk(0, Some("call_1"), Some("lookup"), None))
            .expect("ok");
        assert_eq!(
            event_names(&frames),
            ["content_block_stop", "content_block_start"]
        );
        // Indexes stay strictly increasing across blocks.
        assert_eq!(data_of(&frames[0])["index"], 0);
        assert_eq!(data_of(&frames[1])["index"], 1);
    }

    #[test]
    fn fragments_for_a_closed_tool_block_are_a_protocol_error() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        r.handle_chunk(tool_chunk(0, Some("call_1"), Some("lookup"), Some("{}")))
            .expect("ok");
        // Text forces the tool block shut.
        r.handle_chunk(text_chunk("and")).expect("ok");
        let err = r
            .handle_chunk(tool_chunk(0, None, None, Some("{\"late\":1}")))
            .expect_err("late fragment");
        assert_eq!(err.kind, crate::error::ErrorKind::UpstreamProtocol);
    }

    #[test]
    fn finish_without_a_finish_reason_defaults_to_end_turn() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        r.handle_chunk(text_chunk("partial")).expect("ok");
        let frames = r.finish();
        assert_eq!(
            event_names(&frames),
            ["content_block_stop", "message_delta", "message_stop"]
        );
        assert_eq!(data_of(&frames[1])["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn abort_emits_a_single_error_event_and_silences_the_stream() {
        let mut r = Reassembler::new("claude-sonnet".to_string());
        r.handle_chunk(text_chunk("x")).expect("ok");
        let frames = r.abort(&AppError::upstream_timeout("no data"));
        assert_eq!(event_names(&frames), ["error"]);
        assert_eq!(data_of(&frames[0])["error"]["type"], "api_error");
        assert!(r.finish().is_empty());
        assert!(r.handle_chunk(text_chunk("y")).expect("ignored").is_empty());
    }
}
