//! LLM provider client
//!
//! The agent only needs two request shapes from the provider: a streaming
//! chat step with tool calling, and a one-shot structured generation for the
//! planner. Both live behind the [`LanguageModel`] trait so the loop can be
//! driven by scripted models in tests.
//!
//! The production client speaks the OpenAI-compatible chat completions
//! protocol over SSE, with a long-lived reqwest::Client for connection
//! pooling.

use crate::error::AgentError;
use crate::models::{ContentPart, MessageRole, ResponseMessage};
use crate::tools::ToolDefinition;
use crate::Result;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Incremental content deltas are pushed through this as they arrive.
pub type DeltaHandler<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[derive(Debug, Clone, PartialEq)]
pub struct StepToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFinish {
    Stop,
    ToolCalls,
    Length,
    Other,
}

/// One completed generation round: accumulated text, any requested tool
/// calls, and the provider's finish signal.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub text: String,
    pub tool_calls: Vec<StepToolCall>,
    pub finish: StepFinish,
}

#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stream one assistant step over the given context. Content deltas are
    /// relayed through `on_delta` in arrival order.
    async fn stream_step(
        &self,
        system: &str,
        messages: &[ResponseMessage],
        tools: &[ToolDefinition],
        on_delta: DeltaHandler<'_>,
    ) -> Result<StepOutcome>;

    /// One-shot structured generation returning a JSON object.
    async fn generate_object(&self, prompt: &str) -> Result<Value>;
}

/// Reusable OpenAI-compatible client (connection-pooled).
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    async fn post_completion(&self, request: &ChatCompletionRequest<'_>) -> Result<reqwest::Response> {
        if self.api_key.is_empty() {
            return Err(AgentError::LlmError("model API key is empty".to_string()));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, %body, "LLM provider error");
            return Err(AgentError::LlmError(format!(
                "provider returned {}: {}",
                status, body
            )));
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiClient {
    async fn stream_step(
        &self,
        system: &str,
        messages: &[ResponseMessage],
        tools: &[ToolDefinition],
        on_delta: DeltaHandler<'_>,
    ) -> Result<StepOutcome> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: to_wire_messages(system, messages),
            tools: wire_tools(tools),
            stream: true,
            response_format: None,
        };

        debug!(model = %self.model, context_len = messages.len(), "streaming chat step");

        let response = self.post_completion(&request).await?;
        let mut events = response.bytes_stream().eventsource();

        let mut text = String::new();
        let mut accumulator = ToolCallAccumulator::default();
        let mut finish = None;

        while let Some(event) = events.next().await {
            let event =
                event.map_err(|e| AgentError::LlmError(format!("stream error: {}", e)))?;

            if event.data == "[DONE]" {
                break;
            }

            let chunk: StreamChunk = serde_json::from_str(&event.data)
                .map_err(|e| AgentError::LlmError(format!("malformed stream chunk: {}", e)))?;

            for choice in chunk.choices {
                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        on_delta(&content);
                        text.push_str(&content);
                    }
                }
                if let Some(fragments) = choice.delta.tool_calls {
                    for fragment in fragments {
                        accumulator.absorb(fragment);
                    }
                }
                if let Some(reason) = choice.finish_reason {
                    finish = Some(parse_finish_reason(&reason));
                }
            }
        }

        let tool_calls = accumulator.finish()?;
        let finish = finish.unwrap_or(if tool_calls.is_empty() {
            StepFinish::Stop
        } else {
            StepFinish::ToolCalls
        });

        Ok(StepOutcome {
            text,
            tool_calls,
            finish,
        })
    }

    async fn generate_object(&self, prompt: &str) -> Result<Value> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![WireMessage {
                role: "user",
                content: Some(prompt.to_string()),
                tool_calls: None,
                tool_call_id: None,
            }],
            tools: None,
            stream: false,
            response_format: Some(json!({ "type": "json_object" })),
        };

        let response = self.post_completion(&request).await?;
        let completion: ChatCompletionResponse = response.json().await?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AgentError::LlmError("empty completion".to_string()))?;

        parse_json_content(&content)
    }
}

/// Parse possibly fence-wrapped JSON from a completion body.
pub fn parse_json_content(content: &str) -> Result<Value> {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(cleaned)
        .map_err(|e| AgentError::LlmError(format!("failed to parse structured output: {}", e)))
}

fn parse_finish_reason(reason: &str) -> StepFinish {
    match reason {
        "stop" => StepFinish::Stop,
        "tool_calls" => StepFinish::ToolCalls,
        "length" => StepFinish::Length,
        _ => StepFinish::Other,
    }
}

//
// ================= Wire format =================
//

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
struct WireFunctionDef {
    name: &'static str,
    description: &'static str,
    parameters: Value,
}

fn wire_tools(tools: &[ToolDefinition]) -> Option<Vec<WireTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunctionDef {
                    name: t.name,
                    description: t.description,
                    parameters: t.parameters.clone(),
                },
            })
            .collect(),
    )
}

/// Flatten context messages into provider wire messages. Tool messages fan
/// out to one wire message per result so the provider can correlate each
/// result with the call it answers.
fn to_wire_messages(system: &str, messages: &[ResponseMessage]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);

    wire.push(WireMessage {
        role: "system",
        content: Some(system.to_string()),
        tool_calls: None,
        tool_call_id: None,
    });

    for message in messages {
        match message.role {
            MessageRole::User => wire.push(WireMessage {
                role: "user",
                content: Some(message.text()),
                tool_calls: None,
                tool_call_id: None,
            }),
            MessageRole::Assistant => {
                let text = message.text();
                let tool_calls: Vec<WireToolCall> = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::ToolCall {
                            tool_call_id,
                            tool_name,
                            args,
                        } => Some(WireToolCall {
                            id: tool_call_id.clone(),
                            kind: "function",
                            function: WireFunctionCall {
                                name: tool_name.clone(),
                                arguments: args.to_string(),
                            },
                        }),
                        _ => None,
                    })
                    .collect();

                wire.push(WireMessage {
                    role: "assistant",
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                    tool_call_id: None,
                });
            }
            MessageRole::Tool => {
                for part in &message.parts {
                    if let ContentPart::ToolResult {
                        tool_call_id,
                        result,
                        ..
                    } = part
                    {
                        wire.push(WireMessage {
                            role: "tool",
                            content: Some(result.to_string()),
                            tool_calls: None,
                            tool_call_id: Some(tool_call_id.clone()),
                        });
                    }
                }
            }
        }
    }

    wire
}

//
// ================= Stream decoding =================
//

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Tool calls arrive as indexed fragments spread over many chunks; the
/// argument string in particular streams token by token.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    slots: BTreeMap<usize, AccumulatedCall>,
}

#[derive(Debug, Default)]
struct AccumulatedCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, fragment: ToolCallFragment) {
        let slot = self.slots.entry(fragment.index).or_default();

        if let Some(id) = fragment.id {
            slot.id.push_str(&id);
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                slot.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                slot.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Result<Vec<StepToolCall>> {
        self.slots
            .into_values()
            .map(|slot| {
                let arguments: Value = if slot.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&slot.arguments).map_err(|e| {
                        AgentError::LlmError(format!(
                            "malformed tool call arguments for {}: {}",
                            slot.name, e
                        ))
                    })?
                };

                Ok(StepToolCall {
                    id: slot.id,
                    name: slot.name,
                    arguments,
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = ChatCompletionRequest {
            model: "gpt-4o",
            messages: to_wire_messages("You are helpful.", &[ResponseMessage::user_text("hi")]),
            tools: wire_tools(&crate::tools::tool_definitions()),
            stream: true,
            response_format: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn test_tool_message_fans_out_per_result() {
        let messages = vec![ResponseMessage {
            role: MessageRole::Tool,
            parts: vec![
                ContentPart::ToolResult {
                    tool_call_id: "call_1".to_string(),
                    tool_name: "getStockPrices".to_string(),
                    result: json!({ "price": 1.0 }),
                },
                ContentPart::ToolResult {
                    tool_call_id: "call_2".to_string(),
                    tool_name: "getNews".to_string(),
                    result: Value::Null,
                },
            ],
        }];

        let wire = to_wire_messages("sys", &messages);
        // system + two tool results
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1].role, "tool");
        assert_eq!(wire[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(wire[2].tool_call_id.as_deref(), Some("call_2"));
    }

    #[test]
    fn test_accumulator_merges_fragments() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(ToolCallFragment {
            index: 0,
            id: Some("call_abc".to_string()),
            function: Some(FunctionFragment {
                name: Some("getStockPrices".to_string()),
                arguments: Some("{\"tick".to_string()),
            }),
        });
        acc.absorb(ToolCallFragment {
            index: 0,
            id: None,
            function: Some(FunctionFragment {
                name: None,
                arguments: Some("er\": \"AAPL\"}".to_string()),
            }),
        });

        let calls = acc.finish().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].name, "getStockPrices");
        assert_eq!(calls[0].arguments["ticker"], "AAPL");
    }

    #[test]
    fn test_accumulator_rejects_malformed_arguments() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(ToolCallFragment {
            index: 0,
            id: Some("call_x".to_string()),
            function: Some(FunctionFragment {
                name: Some("getNews".to_string()),
                arguments: Some("{not json".to_string()),
            }),
        });
        assert!(acc.finish().is_err());
    }

    #[test]
    fn test_parse_json_content_strips_fences() {
        let value = parse_json_content("```json\n{\"tasks\": []}\n```").unwrap();
        assert!(value["tasks"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(parse_finish_reason("stop"), StepFinish::Stop);
        assert_eq!(parse_finish_reason("tool_calls"), StepFinish::ToolCalls);
        assert_eq!(parse_finish_reason("length"), StepFinish::Length);
        assert_eq!(parse_finish_reason("content_filter"), StepFinish::Other);
    }
}
