//! Outbound translation: [`MessagesRequest`] → target-specific wire payload.
//!
//! Grounded in the teacher's `backends/anthropic.rs::to_anthropic` (system
//! concatenation, max_tokens default, stop-sequence forwarding) — inverted
//! in direction — and generalized to the fuller tool/tool_choice/content
//! grammar shown in `examples/other_examples`'s agentgateway
//! `llm::conversion::completions::from_messages::translate_internal`.

use serde_json::{json, Value};

use crate::error::AppError;
use crate::types::{ContentBlock, MessageContent, MessagesRequest, Role, ToolChoice};

/// Convert to OpenAI Chat Completions body.
pub fn to_chat_completions(req: &MessagesRequest) -> Result<Value, AppError> {
    let messages = build_messages(req)?;

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": req.stream,
    });

    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if !req.stop_sequences.is_empty() {
        body["stop"] = json!(req.stop_sequences);
    }
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            }))
            .collect::<Vec<_>>());
    }
    if let Some(tc) = &req.tool_choice {
        body["tool_choice"] = tool_choice_to_value(tc);
    }

    Ok(body)
}

/// Convert to OpenAI Responses API body. Reasoning-family models impose
/// stricter tool schema rules: every tool's `strict` is false and its
/// `required` list is filtered to names present in `properties`.
pub fn to_responses_api(req: &MessagesRequest) -> Result<Value, AppError> {
    let messages = build_messages(req)?;

    let mut body = json!({
        "model": req.model,
        "input": messages,
        "max_output_tokens": req.max_tokens,
        "stream": req.stream,
    });

    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    if !req.stop_sequences.is_empty() {
        body["stop"] = json!(req.stop_sequences);
    }
    if !req.tools.is_empty() {
        body["tools"] = json!(req
            .tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize_tool_schema(&t.input_schema),
                    "strict": false,
                }
            }))
            .collect::<Vec<_>>());
    }
    if let Some(tc) = &req.tool_choice {
        body["tool_choice"] = tool_choice_to_value(tc);
    }

    Ok(body)
}

/// Azure uses the same Chat Completions body shape; the URL/header
/// differences are handled entirely in [`crate::upstream`].
pub fn to_azure(req: &MessagesRequest) -> Result<Value, AppError> {
    to_chat_completions(req)
}

/// Native Anthropic passthrough: forwarded byte-identical (no translation);
/// the internal type already mirrors the wire shape.
pub fn to_anthropic_native(req: &MessagesRequest) -> Result<Value, AppError> {
    serde_json::to_value(req).map_err(AppError::from)
}

/// Filter `required` to only names present in `properties`, and default
/// `additionalProperties` to `false` when absent — satisfies spec Scenario F
/// and invariant "required ⊆ properties" for the Responses dialect.
pub fn sanitize_tool_schema(schema: &Value) -> Value {
    let mut schema = schema.clone();
    let Value::Object(map) = &mut schema else { return schema };

    let property_names: std::collections::HashSet<String> = map
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();

    if let Some(Value::Array(required)) = map.get("required") {
        let filtered: Vec<Value> = required
            .iter()
            .filter(|r| r.as_str().map(|s| property_names.contains(s)).unwrap_or(false))
            .cloned()
            .collect();
        map.insert("required".to_string(), Value::Array(filtered));
    }

    if !map.contains_key("additionalProperties") {
        map.insert("additionalProperties".to_string(), Value::Bool(false));
    }

    schema
}

fn tool_choice_to_value(tc: &ToolChoice) -> Value {
    match tc {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
        ToolChoice::None => json!("none"),
    }
}

/// Build the Chat-Completions/Responses-style `messages[]` array.
///
/// - `system` (string or concatenated blocks) becomes a leading
///   `{role: "system", ...}` message.
/// - A `tool_use` block on an assistant message becomes an entry in that
///   message's `tool_calls[]`.
/// - A `tool_result` block — which Anthropic always places in the *next*
///   user-role message — is pulled out into its own `{role: "tool", ...}`
///   message immediately following the assistant message that produced the
///   matching `tool_use`, satisfying the upstream's per-role grouping
///   constraint instead of Anthropic's interleaved one.
/// - Thinking blocks are dropped (never forwarded upstream).
fn build_messages(req: &MessagesRequest) -> Result<Vec<Value>, AppError> {
    let mut out = Vec::new();

    if let Some(system) = &req.system {
        let text = system.concatenated();
        if !text.is_empty() {
            out.push(json!({"role": "system", "content": text}));
        }
    }

    for message in &req.messages {
        let blocks = message.content.as_blocks();

        match message.role {
            Role::User => {
                let mut text_parts = Vec::new();
                for block in &blocks {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.clone()),
                        ContentBlock::Image { source } => {
                            out.push(json!({
                                "role": "user",
                                "content": [image_part(source)],
                            }));
                        }
                        ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                            let content_text = content.as_ref().map(|c| c.as_text()).unwrap_or_default();
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content_text,
                                "is_error": is_error,
                            }));
                        }
                        ContentBlock::ToolUse { .. } | ContentBlock::Thinking { .. } => {
                            // Only expected on the assistant side; ignore if present.
                        }
                    }
                }
                if !text_parts.is_empty() {
                    out.push(json!({"role": "user", "content": text_parts.join("\n")}));
                }
            }
            Role::Assistant => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in &blocks {
                    match block {
                        ContentBlock::Text { text } => text_parts.push(text.clone()),
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": serde_json::to_string(input).map_err(AppError::from)?,
                                }
                            }));
                        }
                        ContentBlock::Thinking { .. } => {
                            // Dropped: never forwarded upstream.
                            // TODO: forward as `reasoning_content` once a
                            // target dialect in this proxy's set accepts it.
                        }
                        ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {
                            // Only expected on the user side; ignore if present.
                        }
                    }
                }

                let mut msg = json!({"role": "assistant"});
                if !text_parts.is_empty() {
                    msg["content"] = json!(text_parts.join("\n"));
                } else {
                    msg["content"] = Value::Null;
                }
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls);
                }
                out.push(msg);
            }
        }
    }

    Ok(out)
}

fn image_part(source: &crate::types::ImageSource) -> Value {
    match source {
        crate::types::ImageSource::Base64 { media_type, data } => json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{media_type};base64,{data}")}
        }),
        crate::types::ImageSource::Url { url } => json!({
            "type": "image_url",
            "image_url": {"url": url}
        }),
    }
}
