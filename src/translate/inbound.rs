//! Inbound translation: upstream JSON response → [`MessagesResponse`].
//!
//! Grounded in the teacher's `backends/anthropic.rs::from_anthropic`
//! (inverted direction: there it strips Anthropic shape down to a generic
//! one, here it builds the Anthropic shape back up) and agentgateway's
//! `translate_response_internal` for the `tool_calls[]` → `tool_use[]` and
//! `finish_reason` → `stop_reason` mappings.

use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::types::{ContentBlock, MessagesResponse, ResponseType, Role, StopReason, Usage};

/// Convert a Chat Completions (or Azure, same shape) response body.
pub fn from_chat_completions(body: &Value, requested_model: &str) -> Result<MessagesResponse, AppError> {
    let choice = body["choices"].get(0).ok_or_else(|| {
        AppError::translation_error("upstream response had no choices[0]")
    })?;
    let message = &choice["message"];

    let mut content = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.to_string() });
        }
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for call in tool_calls {
            content.push(tool_call_to_block(call)?);
        }
    }

    let finish_reason = choice["finish_reason"].as_str();
    let stop_reason = map_finish_reason(finish_reason, !content.is_empty() && has_tool_use(&content));

    let usage = extract_usage(&body["usage"], &content, requested_model);

    Ok(MessagesResponse {
        id: body["id"].as_str().map(str::to_string).unwrap_or_else(|| format!("msg_{}", Uuid::new_v4())),
        response_type: ResponseType::Message,
        role: Role::Assistant,
        model: body["model"].as_str().unwrap_or(requested_model).to_string(),
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    })
}

/// Convert an OpenAI Responses API response body. Shares the tool-call and
/// finish-reason mapping with Chat Completions; differs only in where the
/// assistant output and usage fields live in the envelope.
pub fn from_responses_api(body: &Value, requested_model: &str) -> Result<MessagesResponse, AppError> {
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;

    if let Some(output) = body["output"].as_array() {
        for item in output {
            match item["type"].as_str() {
                Some("message") => {
                    if let Some(parts) = item["content"].as_array() {
                        for part in parts {
                            if let Some(text) = part["text"].as_str() {
                                content.push(ContentBlock::Text { text: text.to_string() });
                            }
                        }
                    }
                }
                Some("function_call") => {
                    let input: Value = item["arguments"]
                        .as_str()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_else(|| serde_json::json!({"_raw": item["arguments"]}));
                    content.push(ContentBlock::ToolUse {
                        id: item["call_id"].as_str().unwrap_or_default().to_string(),
                        name: item["name"].as_str().unwrap_or_default().to_string(),
                        input,
                    });
                    stop_reason = StopReason::ToolUse;
                }
                _ => {}
            }
        }
    }

    if stop_reason != StopReason::ToolUse {
        stop_reason = match body["status"].as_str() {
            Some("incomplete") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };
    }

    let usage = extract_usage(&body["usage"], &content, requested_model);

    Ok(MessagesResponse {
        id: body["id"].as_str().map(str::to_string).unwrap_or_else(|| format!("msg_{}", Uuid::new_v4())),
        response_type: ResponseType::Message,
        role: Role::Assistant,
        model: body["model"].as_str().unwrap_or(requested_model).to_string(),
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    })
}

/// Native Anthropic passthrough: the upstream body already is the target
/// shape.
pub fn from_anthropic_native(body: &Value) -> Result<MessagesResponse, AppError> {
    serde_json::from_value(body.clone())
        .map_err(|e| AppError::translation_error(format!("malformed upstream Anthropic response: {e}")))
}

fn tool_call_to_block(call: &Value) -> Result<ContentBlock, AppError> {
    let id = call["id"].as_str().unwrap_or_default().to_string();
    let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
    let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
    let input = serde_json::from_str(raw_args)
        .unwrap_or_else(|_| serde_json::json!({"_raw": raw_args}));
    Ok(ContentBlock::ToolUse { id, name, input })
}

fn has_tool_use(content: &[ContentBlock]) -> bool {
    content.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }))
}

/// Map `finish_reason` to `stop_reason` per spec §4.2. When a tool call is
/// present in the content and the upstream's own reason didn't already
/// signal one, `tool_use` still takes precedence.
pub(crate) fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> StopReason {
    match reason {
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some("content_filter") => StopReason::StopSequence,
        Some("stop") | None => {
            if has_tool_calls {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }
        }
        Some(_) => StopReason::EndTurn,
    }
}

/// Prefer the upstream's reported usage; fall back to a tiktoken estimate
/// over the response content when usage is omitted (some OpenAI-compatible
/// backends, notably local ones, don't report it).
fn extract_usage(usage_value: &Value, content: &[ContentBlock], model: &str) -> Usage {
    let input_tokens = usage_value["prompt_tokens"].as_u64().or_else(|| usage_value["input_tokens"].as_u64());
    let output_tokens = usage_value["completion_tokens"].as_u64().or_else(|| usage_value["output_tokens"].as_u64());

    match (input_tokens, output_tokens) {
        (Some(i), Some(o)) => Usage { input_tokens: i as u32, output_tokens: o as u32 },
        _ => {
            let text: String = content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            Usage { input_tokens: 0, output_tokens: estimate_tokens(&text, model) }
        }
    }
}

/// Rough token count via `cl100k_base`, falling back to a `len/4` heuristic
/// if the encoder can't be constructed (it's infallible in practice, but
/// `tiktoken-rs` returns a `Result`).
pub(crate) fn estimate_tokens(text: &str, _model: &str) -> u32 {
    match tiktoken_rs::cl100k_base() {
        Ok(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        Err(_) => (text.len() / 4) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_completions_text_response_maps_to_text_block() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let resp = from_chat_completions(&body, "gpt-4o").unwrap();
        assert_eq!(resp.content.len(), 1);
        matches!(&resp.content[0], ContentBlock::Text { text } if text == "hello");
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.usage.output_tokens, 5);
    }

    #[test]
    fn chat_completions_tool_calls_map_to_tool_use_and_stop_reason() {
        let body = json!({
            "id": "chatcmpl-2",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });
        let resp = from_chat_completions(&body, "gpt-4o").unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        match &resp.content[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Paris");
            }
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn malformed_tool_call_arguments_become_raw_string_payload() {
        let body = json!({
            "id": "chatcmpl-3",
            "model": "gpt-4o",
            "choices": [{
                "message": {"tool_calls": [{"id": "call_1", "function": {"name": "f", "arguments": "not json"}}]},
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });
        let resp = from_chat_completions(&body, "gpt-4o").unwrap();
        match &resp.content[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input["_raw"], "not json"),
            _ => panic!("expected tool_use"),
        }
    }

    #[test]
    fn finish_reason_length_maps_to_max_tokens() {
        assert_eq!(map_finish_reason(Some("length"), false), StopReason::MaxTokens);
    }

    #[test]
    fn finish_reason_content_filter_maps_to_stop_sequence() {
        assert_eq!(map_finish_reason(Some("content_filter"), false), StopReason::StopSequence);
    }

    #[test]
    fn missing_usage_falls_back_to_token_estimate() {
        let body = json!({
            "id": "chatcmpl-4",
            "model": "gpt-4o",
            "choices": [{"message": {"content": "a somewhat longer sentence of text"}, "finish_reason": "stop"}]
        });
        let resp = from_chat_completions(&body, "gpt-4o").unwrap();
        assert!(resp.usage.output_tokens > 0);
    }

    #[test]
    fn responses_api_function_call_sets_tool_use_stop_reason() {
        let body = json!({
            "id": "resp_1",
            "model": "o1",
            "output": [{
                "type": "function_call",
                "call_id": "call_1",
                "name": "get_weather",
                "arguments": "{\"city\":\"Paris\"}"
            }],
            "usage": {"input_tokens": 3, "output_tokens": 4}
        });
        let resp = from_responses_api(&body, "o1").unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn responses_api_incomplete_status_maps_to_max_tokens() {
        let body = json!({
            "id": "resp_2",
            "model": "o1",
            "status": "incomplete",
            "output": [{"type": "message", "content": [{"type": "output_text", "text": "partial"}]}],
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let resp = from_responses_api(&body, "o1").unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::MaxTokens));
    }

    #[test]
    fn anthropic_native_passthrough_round_trips() {
        let body = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let resp = from_anthropic_native(&body).unwrap();
        assert_eq!(resp.id, "msg_1");
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
    }
}
