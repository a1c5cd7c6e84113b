//! Model call seam and the OpenAI-compatible chat-completions client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::AgentConfig;
use crate::http_client::build_http_client;
use crate::state::{ChatTurn, GroundingRef, Part, Role};
use crate::tools::{ToolCall, ToolDef};

pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub history: &'a [ChatTurn],
    pub tools: &'a [ToolDef],
}

/// A response may carry both text and tool calls; tool calls win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub grounding_refs: Vec<GroundingRef>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse>;
}

/// Picks the larger-context model when the newest user turn carries video.
#[derive(Debug, Clone)]
pub struct ModelSelection {
    pub default_model: String,
    pub video_model: Option<String>,
}

impl ModelSelection {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            default_model: config.llm_model.clone(),
            video_model: config
                .llm_video_model
                .clone()
                .filter(|model| !model.trim().is_empty()),
        }
    }

    pub fn pick(&self, latest_user_turn: Option<&ChatTurn>) -> &str {
        let has_video = latest_user_turn
            .map(|turn| turn.inline_mime_types().any(|mime| mime.starts_with("video/")))
            .unwrap_or(false);
        match (&self.video_model, has_video) {
            (Some(video_model), true) => video_model,
            _ => &self.default_model,
        }
    }
}

/// A message in the OpenAI chat-completions format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    /// Plain string, or an array of content parts for multimodal turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: &str, content: Option<Value>) -> Self {
        Self {
            role: role.to_string(),
            content,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

/// Render the transcript into chat-completions messages.
///
/// A model turn's tool calls are only rendered when the next turn carries
/// their results; otherwise the provider would reject the dangling calls.
pub fn render_messages(system_prompt: &str, history: &[ChatTurn]) -> Vec<Message> {
    let mut messages = vec![Message::new("system", Some(json!(system_prompt)))];

    for (idx, turn) in history.iter().enumerate() {
        match turn.role {
            Role::User if turn.has_tool_results() => {
                for part in &turn.parts {
                    if let Part::ToolResult { id, response, .. } = part {
                        messages.push(Message {
                            tool_call_id: Some(id.clone()),
                            ..Message::new("tool", Some(json!(response.to_string())))
                        });
                    }
                }
            }
            Role::User => messages.push(Message::new("user", Some(user_content(turn)))),
            Role::Model => {
                let answered = history
                    .get(idx + 1)
                    .map(ChatTurn::has_tool_results)
                    .unwrap_or(false);
                let tool_calls = turn
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::ToolCall { id, name, args } if answered => Some(LlmToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: LlmFunctionCall {
                                name: name.clone(),
                                arguments: args.to_string(),
                            },
                        }),
                        _ => None,
                    })
                    .collect::<Vec<_>>();

                let mut text = turn.text();
                for mime in turn.inline_mime_types() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&format!("[generated {}]", mime));
                }

                if tool_calls.is_empty() && text.is_empty() {
                    continue;
                }
                messages.push(Message {
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    ..Message::new("assistant", (!text.is_empty()).then(|| json!(text)))
                });
            }
        }
    }
    messages
}

fn user_content(turn: &ChatTurn) -> Value {
    let has_inline = turn
        .parts
        .iter()
        .any(|part| matches!(part, Part::InlineData { .. }));
    if !has_inline {
        return json!(turn.text());
    }

    let parts = turn
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(json!({ "type": "text", "text": text })),
            Part::InlineData { mime_type, data } if mime_type.starts_with("image/") => Some(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", mime_type, data) }
            })),
            Part::InlineData { mime_type, data } => Some(json!({
                "type": "text",
                "text": format!("[attached {} payload, {} base64 bytes]", mime_type, data.len())
            })),
            _ => None,
        })
        .collect::<Vec<_>>();
    Value::Array(parts)
}

pub struct OpenAiCompatClient {
    api_url: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(api_url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            api_url: normalize_api_url(api_url),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            temperature: 0.7,
            max_tokens: 4096,
            client: build_http_client()?,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Self::new(&config.llm_api_url, config.llm_api_key.clone())
    }
}

/// Accepts both `http://host:11434` and `http://host:11434/v1`.
fn normalize_api_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse> {
        let url = format!("{}/chat/completions", self.api_url);
        let messages = render_messages(request.system_prompt, request.history);

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(request.tools)?;
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        tracing::debug!(
            "LLM request: model={}, {} message(s), {} tool(s)",
            request.model,
            messages.len(),
            request.tools.len()
        );
        let response = req.send().await.context("Failed to send LLM request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let response_json: Value = response
            .json()
            .await
            .context("Failed to parse LLM response")?;
        parse_completion(&response_json)
    }
}

fn parse_completion(response_json: &Value) -> Result<ModelResponse> {
    let message = &response_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .context("Empty choices in LLM response")?["message"];

    let text = message["content"]
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(String::from);

    let raw_calls: Vec<LlmToolCall> = message
        .get("tool_calls")
        .filter(|calls| !calls.is_null())
        .map(|calls| serde_json::from_value(calls.clone()))
        .transpose()
        .context("Malformed tool_calls in LLM response")?
        .unwrap_or_default();

    let tool_calls = raw_calls
        .into_iter()
        .map(|call| {
            let arguments = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
                    tracing::warn!("Failed to parse tool arguments as JSON: {}", e);
                    json!({})
                })
            };
            let id = if call.id.trim().is_empty() {
                format!("call_{}", uuid::Uuid::new_v4().simple())
            } else {
                call.id
            };
            ToolCall {
                id,
                name: call.function.name,
                arguments,
            }
        })
        .collect();

    Ok(ModelResponse {
        text,
        tool_calls,
        grounding_refs: Vec::new(),
    })
}

/// Replays canned responses and records what it was asked.
#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub model: String,
        pub system_prompt: String,
        pub history: Vec<ChatTurn>,
        pub tool_names: Vec<String>,
    }

    #[derive(Default)]
    pub struct ScriptedModel {
        responses: Mutex<VecDeque<Result<ModelResponse>>>,
        requests: Mutex<Vec<RecordedRequest>>,
        /// Returned once the script runs out; `None` means error.
        fallback: Option<ModelResponse>,
    }

    impl ScriptedModel {
        pub fn new(responses: Vec<Result<ModelResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        pub fn repeating(response: ModelResponse) -> Self {
            Self {
                fallback: Some(response),
                ..Self::default()
            }
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse> {
            self.requests.lock().unwrap().push(RecordedRequest {
                model: request.model.to_string(),
                system_prompt: request.system_prompt.to_string(),
                history: request.history.to_vec(),
                tool_names: request
                    .tools
                    .iter()
                    .map(|def| def.function.name.clone())
                    .collect(),
            });
            let next = self.responses.lock().unwrap().pop_front();
            match (next, &self.fallback) {
                (Some(response), _) => response,
                (None, Some(fallback)) => Ok(fallback.clone()),
                (None, None) => anyhow::bail!("scripted model ran out of responses"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_turn(id: &str) -> ChatTurn {
        ChatTurn {
            role: Role::Model,
            parts: vec![Part::ToolCall {
                id: id.to_string(),
                name: "write_journal".to_string(),
                args: json!({"event": "x"}),
            }],
            grounding_refs: Vec::new(),
        }
    }

    fn result_turn(id: &str) -> ChatTurn {
        ChatTurn {
            role: Role::User,
            parts: vec![Part::ToolResult {
                id: id.to_string(),
                name: "write_journal".to_string(),
                response: json!({"result": "ok"}),
            }],
            grounding_refs: Vec::new(),
        }
    }

    #[test]
    fn renders_tool_round_trip_in_openai_shape() {
        let history = vec![
            ChatTurn::user_text("hi"),
            call_turn("c1"),
            result_turn("c1"),
            ChatTurn::model_text("done"),
        ];
        let messages = render_messages("sys", &history);
        let roles = messages.iter().map(|m| m.role.as_str()).collect::<Vec<_>>();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);

        let json = serde_json::to_value(&messages[2]).unwrap();
        assert_eq!(json["tool_calls"][0]["function"]["name"], "write_journal");
        assert!(json.get("content").is_none());
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn unanswered_tool_calls_are_omitted() {
        let mut grounded = ChatTurn::model_text("Answer with sources");
        grounded.grounding_refs.push(GroundingRef {
            title: "t".to_string(),
            uri: "https://example.com".to_string(),
        });
        let history = vec![ChatTurn::user_text("search"), call_turn("c1"), grounded];
        let messages = render_messages("sys", &history);
        let roles = messages.iter().map(|m| m.role.as_str()).collect::<Vec<_>>();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }

    #[test]
    fn inline_images_become_data_uris_and_video_a_placeholder() {
        let turn = ChatTurn {
            role: Role::User,
            parts: vec![
                Part::Text {
                    text: "look".to_string(),
                },
                Part::InlineData {
                    mime_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                },
                Part::InlineData {
                    mime_type: "video/mp4".to_string(),
                    data: "BBBB".to_string(),
                },
            ],
            grounding_refs: Vec::new(),
        };
        let content = user_content(&turn);
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert!(content[2]["text"].as_str().unwrap().contains("video/mp4"));
    }

    #[test]
    fn video_attachment_selects_video_model() {
        let selection = ModelSelection {
            default_model: "small".to_string(),
            video_model: Some("large".to_string()),
        };
        let video = ChatTurn {
            role: Role::User,
            parts: vec![Part::InlineData {
                mime_type: "video/webm".to_string(),
                data: String::new(),
            }],
            grounding_refs: Vec::new(),
        };
        assert_eq!(selection.pick(Some(&video)), "large");
        assert_eq!(selection.pick(Some(&ChatTurn::user_text("hi"))), "small");
        assert_eq!(selection.pick(None), "small");
    }

    #[test]
    fn parses_text_and_tool_calls() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": "  thinking out loud ",
                    "tool_calls": [{
                        "id": "",
                        "type": "function",
                        "function": { "name": "recharge", "arguments": "" }
                    }]
                }
            }]
        });
        let parsed = parse_completion(&response).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("thinking out loud"));
        assert_eq!(parsed.tool_calls[0].name, "recharge");
        assert_eq!(parsed.tool_calls[0].arguments, json!({}));
        assert!(parsed.tool_calls[0].id.starts_with("call_"));

        assert!(parse_completion(&json!({"choices": []})).is_err());
    }

    #[test]
    fn api_url_gets_v1_suffix_once() {
        assert_eq!(normalize_api_url("http://h:1/"), "http://h:1/v1");
        assert_eq!(normalize_api_url("http://h:1/v1"), "http://h:1/v1");
    }
}
