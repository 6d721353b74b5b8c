//! Streaming translator: upstream SSE byte stream → Anthropic-shaped SSE
//! event sequence.
//!
//! Grounded in `other_examples` spiceai's `types_stream.rs`
//! (`StreamState`/per-index content-block tracking, and the "only the first
//! tool_call packet carries id/name" observation), mirrored in direction —
//! spiceai translates Anthropic→OpenAI, this translates OpenAI→Anthropic —
//! and agentgateway's closure-based stream state threading. The
//! producer/bounded-channel split generalizes the teacher's streaming
//! passthrough (`backends/openai.rs` forwarded raw bytes; this crate needs
//! schema-translating passthrough instead).

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::translate::inbound::{estimate_tokens, map_finish_reason};
use crate::types::{StopReason, Usage};
use crate::upstream::ByteStream;

/// One Anthropic-shaped SSE frame: `event: {name}\ndata: {data}\n\n`.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: &'static str,
    pub data: Value,
}

impl SseEvent {
    fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Tool,
}

struct OpenBlock {
    anthropic_index: u32,
    kind: BlockKind,
}

struct StreamState {
    next_index: u32,
    open: Option<OpenBlock>,
    tool_index_map: HashMap<u32, u32>,
    text_chars: usize,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl StreamState {
    fn new() -> Self {
        Self {
            next_index: 0,
            open: None,
            tool_index_map: HashMap::new(),
            text_chars: 0,
            stop_reason: None,
            usage: Usage::default(),
        }
    }
}

/// Drive the producer side: read `upstream`, translate each frame, and send
/// the resulting Anthropic SSE events to `tx`. Heartbeats are sent whenever
/// `ping_interval` elapses without upstream data. Runs until the upstream
/// stream ends, a terminal error occurs, or the receiver is dropped (client
/// disconnected).
pub async fn drive(
    mut upstream: ByteStream,
    message_id: String,
    model: String,
    ping_interval: Duration,
    tx: mpsc::Sender<SseEvent>,
) -> Usage {
    let mut state = StreamState::new();
    let mut buf: Vec<u8> = Vec::new();

    let message_start = json!({
        "type": "message_start",
        "message": {
            "id": message_id,
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [],
            "stop_reason": Value::Null,
            "stop_sequence": Value::Null,
            "usage": {"input_tokens": 0, "output_tokens": 0},
        }
    });
    if tx.send(SseEvent::new("message_start", message_start)).await.is_err() {
        return state.usage;
    }

    loop {
        tokio::select! {
            biased;
            frame = next_data_frame(&mut upstream, &mut buf) => {
                match frame {
                    Ok(Some(data)) => {
                        if data.trim() == "[DONE]" {
                            break;
                        }
                        let parsed: Value = match serde_json::from_str(&data) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if !handle_frame(&parsed, &mut state, &tx).await {
                            return state.usage;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(SseEvent::new(
                            "error",
                            json!({"type": "error", "error": {"type": "upstream_error", "message": e.to_string()}}),
                        )).await;
                        return state.usage;
                    }
                }
            }
            _ = tokio::time::sleep(ping_interval) => {
                if tx.send(SseEvent::new("ping", json!({"type": "ping"}))).await.is_err() {
                    return state.usage;
                }
            }
        }
    }

    if let Some(open) = state.open.take() {
        let _ = tx.send(SseEvent::new("content_block_stop", json!({"type": "content_block_stop", "index": open.anthropic_index}))).await;
    }

    if state.usage.output_tokens == 0 && state.text_chars > 0 {
        state.usage.output_tokens = estimate_tokens(&"x".repeat(state.text_chars), &model);
    }

    let stop_reason = state.stop_reason.unwrap_or(StopReason::EndTurn);
    let message_delta = json!({
        "type": "message_delta",
        "delta": {"stop_reason": stop_reason, "stop_sequence": Value::Null},
        "usage": {"output_tokens": state.usage.output_tokens},
    });
    if tx.send(SseEvent::new("message_delta", message_delta)).await.is_err() {
        return state.usage;
    }
    let _ = tx.send(SseEvent::new("message_stop", json!({"type": "message_stop"}))).await;
    state.usage
}

/// Returns `false` if the receiver was dropped (client disconnected) and the
/// producer should stop.
async fn handle_frame(frame: &Value, state: &mut StreamState, tx: &mpsc::Sender<SseEvent>) -> bool {
    let choice = &frame["choices"][0];
    let delta = &choice["delta"];

    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            if !matches!(&state.open, Some(o) if o.kind == BlockKind::Text) {
                if !close_current(state, tx).await {
                    return false;
                }
                let index = state.next_index;
                state.next_index += 1;
                state.open = Some(OpenBlock { anthropic_index: index, kind: BlockKind::Text });
                let start = json!({"type": "content_block_start", "index": index, "content_block": {"type": "text", "text": ""}});
                if tx.send(SseEvent::new("content_block_start", start)).await.is_err() {
                    return false;
                }
            }
            let index = state.open.as_ref().unwrap().anthropic_index;
            state.text_chars += text.chars().count();
            let delta_event = json!({"type": "content_block_delta", "index": index, "delta": {"type": "text_delta", "text": text}});
            if tx.send(SseEvent::new("content_block_delta", delta_event)).await.is_err() {
                return false;
            }
        }
    }

    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for call in tool_calls {
            let upstream_index = call["index"].as_u64().unwrap_or(0) as u32;
            let anthropic_index = match state.tool_index_map.get(&upstream_index) {
                Some(i) => *i,
                None => {
                    if !close_current(state, tx).await {
                        return false;
                    }
                    let index = state.next_index;
                    state.next_index += 1;
                    state.tool_index_map.insert(upstream_index, index);
                    state.open = Some(OpenBlock { anthropic_index: index, kind: BlockKind::Tool });

                    let id = call["id"].as_str().unwrap_or_default();
                    let name = call["function"]["name"].as_str().unwrap_or_default();
                    let start = json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    });
                    if tx.send(SseEvent::new("content_block_start", start)).await.is_err() {
                        return false;
                    }
                    index
                }
            };

            if let Some(fragment) = call["function"]["arguments"].as_str() {
                if !fragment.is_empty() {
                    let delta_event = json!({
                        "type": "content_block_delta",
                        "index": anthropic_index,
                        "delta": {"type": "input_json_delta", "partial_json": fragment},
                    });
                    if tx.send(SseEvent::new("content_block_delta", delta_event)).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    if let Some(usage) = frame.get("usage").filter(|u| !u.is_null()) {
        if let Some(input) = usage["prompt_tokens"].as_u64() {
            state.usage.input_tokens = input as u32;
        }
        if let Some(output) = usage["completion_tokens"].as_u64() {
            state.usage.output_tokens = output as u32;
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str() {
        let has_tool = state.open.as_ref().map(|o| o.kind == BlockKind::Tool).unwrap_or(false);
        state.stop_reason = Some(map_finish_reason(Some(reason), has_tool));
    }

    true
}

async fn close_current(state: &mut StreamState, tx: &mpsc::Sender<SseEvent>) -> bool {
    if let Some(open) = state.open.take() {
        let event = json!({"type": "content_block_stop", "index": open.anthropic_index});
        if tx.send(SseEvent::new("content_block_stop", event)).await.is_err() {
            return false;
        }
    }
    true
}

/// Pull the next complete SSE frame's `data:` payload from `upstream`,
/// buffering partial reads across calls. Frames with no `data:` line (bare
/// comments, `event:` lines without data) are skipped transparently.
async fn next_data_frame(upstream: &mut ByteStream, buf: &mut Vec<u8>) -> anyhow::Result<Option<String>> {
    loop {
        if let Some(pos) = find_frame_boundary(buf) {
            let frame: Vec<u8> = buf.drain(..pos).collect();
            // drop the boundary itself ("\n\n" or "\r\n\r\n")
            let boundary_len = if buf.starts_with(b"\r\n") { 4 } else { 2 };
            let _ = buf.drain(..boundary_len.min(buf.len()));
            if let Some(data) = extract_data_payload(&frame) {
                return Ok(Some(data));
            }
            continue;
        }

        match upstream.next().await {
            Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
            Some(Err(e)) => return Err(e),
            None => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let remainder = std::mem::take(buf);
                return Ok(extract_data_payload(&remainder));
            }
        }
    }
}

fn find_frame_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n").or_else(|| {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    })
}

fn extract_data_payload(frame: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(frame);
    let mut parts = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            parts.push(rest.trim_start().to_string());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Adapt a `mpsc::Receiver<SseEvent>` into a `Stream`, completing the
/// producer/writer split described in the streaming design: the channel is
/// the bounded buffer, this is the writer side's pull.
pub fn into_stream(rx: mpsc::Receiver<SseEvent>) -> impl Stream<Item = SseEvent> {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn byte_stream(chunks: Vec<&'static str>) -> ByteStream {
        let s = futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
        Box::pin(s)
    }

    async fn collect_events(upstream: ByteStream) -> Vec<SseEvent> {
        let (tx, rx) = mpsc::channel(32);
        drive(upstream, "msg_1".into(), "gpt-4o".into(), Duration::from_secs(30), tx).await;
        let mut out = Vec::new();
        let mut rx = rx;
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn text_deltas_produce_one_block_with_start_and_stop() {
        let upstream = byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let events = collect_events(upstream).await;
        let names: Vec<&str> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            names,
            vec!["message_start", "content_block_start", "content_block_delta", "content_block_delta", "content_block_stop", "message_delta", "message_stop"]
        );
        assert_eq!(events[2].data["delta"]["text"], "He");
        assert_eq!(events[3].data["delta"]["text"], "llo");
        assert_eq!(events[5].data["delta"]["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn tool_call_deltas_open_tool_use_block_once() {
        let upstream = byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\":\\\"Paris\\\"}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let events = collect_events(upstream).await;
        let starts: Vec<_> = events.iter().filter(|e| e.event == "content_block_start").collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].data["content_block"]["name"], "get_weather");
        let deltas: Vec<_> = events.iter().filter(|e| e.event == "content_block_delta").collect();
        assert_eq!(deltas.len(), 2);
        let message_delta = events.iter().find(|e| e.event == "message_delta").unwrap();
        assert_eq!(message_delta.data["delta"]["stop_reason"], "tool_use");
    }

    #[tokio::test]
    async fn empty_upstream_still_emits_start_and_stop() {
        let upstream = byte_stream(vec!["data: [DONE]\n\n"]);
        let events = collect_events(upstream).await;
        let names: Vec<&str> = events.iter().map(|e| e.event).collect();
        assert_eq!(names, vec!["message_start", "message_delta", "message_stop"]);
    }

    #[tokio::test]
    async fn frame_split_across_chunks_is_reassembled() {
        let upstream = byte_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel",
            "lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let events = collect_events(upstream).await;
        let delta = events.iter().find(|e| e.event == "content_block_delta").unwrap();
        assert_eq!(delta.data["delta"]["text"], "Hello");
    }
}
