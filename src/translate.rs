//! Conversion between Chat Completions and Responses payloads.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::error::GatewayError;
use crate::protocol::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatContentPart, ChatMessage,
    ChatMessageContent, ChatResponseMessage, ChatToolCall, ChatToolCallFunction, ChatUsage,
    FinishReason, PromptTokensDetails, ReasoningEffort, ResponseInputContent,
    ResponseInputContentPart, ResponseInputItem, ResponseOutputContent, ResponseOutputItem,
    ResponseReasoning, ResponseStatus, ResponseTool, ResponsesRequest, ResponsesResponse,
    ResponsesUsage, Role,
};
use crate::stream::RawEvent;

/// Extra output requested whenever reasoning is enabled, so reasoning can be
/// carried across turns without server-side state
pub const ENCRYPTED_REASONING_INCLUDE: &str = "reasoning.encrypted_content";

// ============================================================================
// Chat Completions → Responses
// ============================================================================

/// Convert a Chat Completions request into a Responses request
pub fn to_responses_request(req: &ChatCompletionRequest) -> ResponsesRequest {
    let mut instructions: Option<Vec<String>> = None;
    let mut input = Vec::new();

    for msg in &req.messages {
        if msg.role.is_instruction() {
            let text = msg
                .content
                .as_ref()
                .map(ChatMessageContent::flatten_text)
                .unwrap_or_default();
            instructions.get_or_insert_with(Vec::new).push(text);
            continue;
        }
        convert_message(msg, &mut input);
    }

    let tools = req.tools.as_ref().and_then(|tools| {
        let mapped: Vec<ResponseTool> = tools
            .iter()
            .map(|tool| ResponseTool {
                tool_type: tool.tool_type.clone(),
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: tool.function.parameters.clone(),
            })
            .collect();

        (!mapped.is_empty()).then_some(mapped)
    });

    let reasoning = req
        .reasoning_effort
        .filter(|effort| *effort != ReasoningEffort::None)
        .map(|effort| ResponseReasoning {
            effort: coarse_effort(effort),
            summary: "auto".to_string(),
        });
    let include = reasoning
        .is_some()
        .then(|| vec![ENCRYPTED_REASONING_INCLUDE.to_string()]);

    ResponsesRequest {
        model: req.model.clone(),
        input,
        instructions: instructions.map(|parts| parts.join("\n")),
        store: false,
        max_output_tokens: req.output_cap(),
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        tools,
        tool_choice: req.tool_choice.as_ref().map(map_tool_choice),
        reasoning,
        include,
    }
}

/// The Responses backend only knows low/medium/high
fn coarse_effort(effort: ReasoningEffort) -> ReasoningEffort {
    match effort {
        ReasoningEffort::Minimal => ReasoningEffort::Low,
        ReasoningEffort::Xhigh => ReasoningEffort::High,
        other => other,
    }
}

fn map_tool_choice(value: &Value) -> Value {
    let Some(obj) = value.as_object() else {
        return value.clone();
    };
    let is_function = obj.get("type").and_then(Value::as_str) == Some("function");
    let name = obj
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(Value::as_str);

    match name {
        Some(name) if is_function => serde_json::json!({ "type": "function", "name": name }),
        _ => value.clone(),
    }
}

fn convert_message(msg: &ChatMessage, input: &mut Vec<ResponseInputItem>) {
    if msg.role == Role::Tool {
        input.push(ResponseInputItem::FunctionCallOutput {
            call_id: msg.tool_call_id.clone().unwrap_or_default(),
            output: msg
                .content
                .as_ref()
                .map(ChatMessageContent::flatten_text)
                .unwrap_or_default(),
        });
        return;
    }

    let tool_calls = msg.tool_calls.as_deref().unwrap_or_default();

    // An assistant turn that only calls tools has no message of its own
    if msg.content.is_some() || tool_calls.is_empty() {
        input.push(ResponseInputItem::Message {
            role: msg.role,
            content: convert_content(msg.content.as_ref()),
        });
    }

    for call in tool_calls {
        input.push(ResponseInputItem::FunctionCall {
            call_id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
        });
    }
}

fn convert_content(content: Option<&ChatMessageContent>) -> ResponseInputContent {
    match content {
        None => ResponseInputContent::Text(String::new()),
        Some(ChatMessageContent::Parts(parts)) if parts.is_empty() => {
            ResponseInputContent::Text(String::new())
        }
        Some(ChatMessageContent::Text(text)) => ResponseInputContent::Text(text.clone()),
        Some(ChatMessageContent::Parts(parts)) => ResponseInputContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    // `input_text` regardless of role; `output_text` is rejected on input
                    ChatContentPart::Text { text } => {
                        ResponseInputContentPart::InputText { text: text.clone() }
                    }
                    ChatContentPart::ImageUrl { image_url } => {
                        ResponseInputContentPart::InputImage {
                            image_url: image_url.url.clone(),
                            detail: image_url.detail.clone(),
                        }
                    }
                })
                .collect(),
        ),
    }
}

// ============================================================================
// Responses → Chat Completions
// ============================================================================

/// Convert a completed Responses object into a Chat Completions response.
/// `fallback_model` is used when the backend omits the model name.
pub fn to_chat_response(resp: &ResponsesResponse, fallback_model: &str) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for item in &resp.output {
        match item {
            ResponseOutputItem::Message { content } => {
                for part in content {
                    if let ResponseOutputContent::OutputText { text: part_text } = part {
                        text.push_str(part_text);
                    }
                }
            }
            ResponseOutputItem::Reasoning { summary } => {
                for part in summary {
                    reasoning.push_str(&part.text);
                }
            }
            ResponseOutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => tool_calls.push(ChatToolCall {
                id: call_id.clone(),
                tool_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: arguments.clone(),
                },
            }),
            ResponseOutputItem::Other => {}
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else if resp.status == ResponseStatus::Incomplete {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };

    let model = if resp.model.is_empty() {
        fallback_model.to_string()
    } else {
        resp.model.clone()
    };

    ChatCompletionResponse {
        id: resp.id.clone(),
        object: "chat.completion".to_string(),
        created: resp.created_at,
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: Role::Assistant,
                content: (!text.is_empty()).then_some(text),
                reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason,
            logprobs: None,
        }],
        usage: resp.usage.as_ref().map(to_chat_usage),
    }
}

fn to_chat_usage(usage: &ResponsesUsage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
        prompt_tokens_details: usage
            .input_tokens_details
            .as_ref()
            .map(|details| PromptTokensDetails {
                cached_tokens: details.cached_tokens,
            }),
    }
}

#[derive(Deserialize)]
struct TerminalEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    response: Option<ResponsesResponse>,
}

/// Some backends answer non-streaming requests with an SSE body. Pull the
/// final `response` object out of the last `response.completed` /
/// `response.done` event.
pub async fn extract_final_response<S, E>(events: S) -> Result<ResponsesResponse, GatewayError>
where
    S: Stream<Item = Result<RawEvent, E>>,
    E: Display,
{
    futures::pin_mut!(events);
    let mut final_response = None;

    while let Some(raw) = events.next().await {
        let raw = raw.map_err(|e| GatewayError::InvalidUpstream(format!("SSE body: {e}")))?;
        let Some(data) = raw.data.as_deref().map(str::trim) else {
            continue;
        };
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<TerminalEvent>(data) else {
            continue;
        };
        let kind = raw.event.as_deref().unwrap_or(&event.event_type);
        if matches!(kind, "response.completed" | "response.done") && event.response.is_some() {
            final_response = event.response;
        }
    }

    final_response.ok_or_else(|| {
        GatewayError::InvalidUpstream("could not find final response in SSE stream".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::decode_events;
    use bytes::Bytes;
    use serde_json::json;
    use std::convert::Infallible;

    fn chat_request(value: Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    fn responses(value: Value) -> ResponsesResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn user_and_assistant_only_never_sets_instructions() {
        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }));
        let mapped = to_responses_request(&req);
        assert_eq!(mapped.instructions, None);
        assert_eq!(mapped.input.len(), 2);
        assert!(!mapped.store);
    }

    #[test]
    fn instructions_join_system_and_developer_in_order() {
        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "sys1"},
                {"role": "user", "content": "hi"},
                {"role": "developer", "content": [
                    {"type": "text", "text": "dev-a"},
                    {"type": "text", "text": "dev-b"}
                ]},
                {"role": "assistant", "content": "ok"},
                {"role": "system", "content": "sys2"}
            ]
        }));
        let mapped = to_responses_request(&req);
        assert_eq!(
            mapped.instructions.as_deref(),
            Some("sys1\ndev-a\ndev-b\nsys2")
        );
        assert_eq!(mapped.input.len(), 2);
    }

    #[test]
    fn content_parts_and_missing_content_are_mapped() {
        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "look"},
                    {"type": "image_url", "image_url": {"url": "https://x/cat.png"}}
                ]},
                {"role": "assistant", "content": null},
                {"role": "user", "content": []}
            ]
        }));
        let value = serde_json::to_value(to_responses_request(&req)).unwrap();

        assert_eq!(
            value["input"][0]["content"],
            json!([
                {"type": "input_text", "text": "look"},
                {"type": "input_image", "image_url": "https://x/cat.png"}
            ])
        );
        assert_eq!(value["input"][1]["role"], "assistant");
        assert_eq!(value["input"][1]["content"], "");
        assert_eq!(value["input"][2]["role"], "user");
        assert_eq!(value["input"][2]["content"], "");
        assert_eq!(value["store"], false);
    }

    #[test]
    fn tools_and_tool_choice_are_flattened() {
        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{
                "type": "function",
                "function": {"name": "get_weather", "description": "d", "parameters": {"type": "object"}}
            }],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}}
        }));
        let value = serde_json::to_value(to_responses_request(&req)).unwrap();
        assert_eq!(
            value["tools"][0],
            json!({"type": "function", "name": "get_weather", "description": "d", "parameters": {"type": "object"}})
        );
        assert_eq!(value["tool_choice"], json!({"type": "function", "name": "get_weather"}));

        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [],
            "tool_choice": "required"
        }));
        let mapped = to_responses_request(&req);
        assert!(mapped.tools.is_none());
        assert_eq!(mapped.tool_choice, Some(json!("required")));
    }

    #[test]
    fn reasoning_is_coarsened_and_requests_encrypted_content() {
        let mut req = chat_request(json!({
            "model": "gpt-5",
            "messages": [{"role": "user", "content": "hi"}],
            "reasoning_effort": "minimal"
        }));
        let mapped = to_responses_request(&req);
        let reasoning = mapped.reasoning.unwrap();
        assert_eq!(reasoning.effort, ReasoningEffort::Low);
        assert_eq!(reasoning.summary, "auto");
        assert_eq!(
            mapped.include,
            Some(vec![ENCRYPTED_REASONING_INCLUDE.to_string()])
        );

        req.reasoning_effort = Some(ReasoningEffort::Xhigh);
        assert_eq!(
            to_responses_request(&req).reasoning.unwrap().effort,
            ReasoningEffort::High
        );

        req.reasoning_effort = Some(ReasoningEffort::None);
        let mapped = to_responses_request(&req);
        assert!(mapped.reasoning.is_none());
        assert!(mapped.include.is_none());
    }

    #[test]
    fn scalars_copy_only_when_present() {
        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "max_tokens": 64
        }));
        let value = serde_json::to_value(to_responses_request(&req)).unwrap();
        assert_eq!(value["temperature"], 0.5);
        assert_eq!(value["max_output_tokens"], 64);
        assert!(value.get("top_p").is_none());
        assert!(value.get("stream").is_none());
    }

    #[test]
    fn tool_history_becomes_function_call_items() {
        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "rainy"}
            ]
        }));
        let value = serde_json::to_value(to_responses_request(&req)).unwrap();
        assert_eq!(value["input"].as_array().unwrap().len(), 3);
        assert_eq!(
            value["input"][1],
            json!({"type": "function_call", "call_id": "call_1", "name": "get_weather", "arguments": "{\"city\":\"Oslo\"}"})
        );
        assert_eq!(
            value["input"][2],
            json!({"type": "function_call_output", "call_id": "call_1", "output": "rainy"})
        );
    }

    #[test]
    fn conversion_is_pure() {
        let req = chat_request(json!({
            "model": "gpt-5",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ],
            "reasoning_effort": "high",
            "stream": true
        }));
        assert_eq!(to_responses_request(&req), to_responses_request(&req));
    }

    #[test]
    fn function_call_only_response_has_null_content() {
        let resp = responses(json!({
            "id": "resp_1",
            "status": "completed",
            "model": "gpt-5",
            "output": [{
                "type": "function_call", "call_id": "call_9",
                "name": "lookup", "arguments": "{\"q\":1}"
            }]
        }));
        let chat = to_chat_response(&resp, "gpt-5");
        let choice = &chat.choices[0];
        assert_eq!(choice.finish_reason, FinishReason::ToolCalls);
        assert_eq!(choice.message.content, None);
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].function.arguments, "{\"q\":1}");

        let value = serde_json::to_value(&chat).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], Value::Null);
        assert!(value["choices"][0]["message"].get("reasoning_content").is_none());
    }

    #[test]
    fn text_reasoning_and_usage_are_collected() {
        let resp = responses(json!({
            "id": "resp_2",
            "status": "incomplete",
            "created_at": 1_700_000_000u64,
            "model": "",
            "output": [
                {"type": "reasoning", "summary": [{"type": "summary_text", "text": "think"}]},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "Hi"},
                    {"type": "output_text", "text": " there"}
                ]}
            ],
            "usage": {
                "input_tokens": 10, "output_tokens": 5, "total_tokens": 15,
                "input_tokens_details": {"cached_tokens": 4}
            }
        }));
        let chat = to_chat_response(&resp, "gpt-5");
        assert_eq!(chat.model, "gpt-5");
        assert_eq!(chat.object, "chat.completion");
        let choice = &chat.choices[0];
        assert_eq!(choice.finish_reason, FinishReason::Length);
        assert_eq!(choice.message.content.as_deref(), Some("Hi there"));
        assert_eq!(choice.message.reasoning_content.as_deref(), Some("think"));
        assert!(choice.message.tool_calls.is_none());

        let usage = chat.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.prompt_tokens_details.unwrap().cached_tokens, 4);
    }

    #[test]
    fn absent_usage_stays_absent() {
        let resp = responses(json!({"id": "resp_3", "output": []}));
        let chat = to_chat_response(&resp, "gpt-5");
        assert!(chat.usage.is_none());
        assert_eq!(chat.choices[0].finish_reason, FinishReason::Stop);
    }

    async fn extract_from_body(body: &'static str) -> Result<ResponsesResponse, GatewayError> {
        let bytes = futures::stream::iter([Ok::<_, Infallible>(Bytes::from(body))]);
        extract_final_response(decode_events(bytes)).await
    }

    #[tokio::test]
    async fn extracts_final_response_from_sse_body() {
        let body = concat!(
            "event: response.created\n",
            "data: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_1\",\"status\":\"in_progress\"}}\n\n",
            "event: response.output_text.delta\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hi\"}\n\n",
            "event: response.completed\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\",\"status\":\"completed\",",
            "\"output\":[{\"type\":\"message\",\"content\":[{\"type\":\"output_text\",\"text\":\"Hi\"}]}]}}\n\n",
            "data: [DONE]\n\n"
        );
        let resp = extract_from_body(body).await.unwrap();
        assert_eq!(resp.id, "resp_1");
        assert_eq!(resp.status, ResponseStatus::Completed);
        assert_eq!(resp.output.len(), 1);

        let err = extract_from_body("data: {\"type\":\"response.created\"}\n\n")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidUpstream(_)));
    }

    #[tokio::test]
    async fn final_response_split_over_data_lines_is_joined() {
        let body = concat!(
            "event: response.completed\n",
            "data: {\"type\":\"response.completed\",\n",
            "data: \"response\":{\"id\":\"resp_9\",\"status\":\"completed\",\"output\":[]}}\n\n"
        );
        let resp = extract_from_body(body).await.unwrap();
        assert_eq!(resp.id, "resp_9");
    }
}
