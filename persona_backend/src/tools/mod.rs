//! Tools the model can invoke during a turn.
//!
//! Every tool has the same shape: a JSON Schema for its parameters and an
//! async handler taking `(params, current state)` and returning an output
//! plus an optional `StateDelta`. The orchestrator threads the current
//! accumulated state into each call; tools never hold a state reference.

pub mod cognition;
pub mod files;
pub mod integrations;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::AgentConfig;
use crate::state::mutations::StateDelta;
use crate::state::{AgentState, GroundingRef};

/// How the orchestrator treats a tool's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    /// Result is folded into the tool-response turn.
    Standard,
    /// Result is a finished, citable answer that ends an interactive turn.
    Grounding,
    /// Long-running media production; emits progress and yields a payload.
    Generative,
}

/// The result of executing a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
    /// Tool execution failed; fed back to the model so it can adapt.
    Error(String),
    /// The backing integration is not configured.
    Disabled { reason: String },
    Grounded {
        text: String,
        refs: Vec<GroundingRef>,
    },
    /// Base64 payload produced by a generative tool.
    Media {
        mime_type: String,
        data: String,
        caption: Option<String>,
    },
}

impl ToolOutput {
    /// Value placed in the tool-result part of the transcript.
    pub fn to_response_value(&self) -> Value {
        match self {
            ToolOutput::Text(text) => json!({ "result": text }),
            ToolOutput::Json(value) => value.clone(),
            ToolOutput::Error(error) => json!({ "error": error }),
            ToolOutput::Disabled { reason } => json!({ "disabled": true, "reason": reason }),
            ToolOutput::Grounded { text, refs } => json!({ "result": text, "sources": refs }),
            // Media bytes stay out of the transcript; the media turn carries them.
            ToolOutput::Media {
                mime_type, caption, ..
            } => json!({ "generated": mime_type, "caption": caption }),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ToolOutput::Error(_) | ToolOutput::Disabled { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: ToolOutput,
    pub delta: Option<StateDelta>,
}

impl ToolOutcome {
    pub fn output(output: ToolOutput) -> Self {
        Self {
            output,
            delta: None,
        }
    }

    pub fn with_delta(output: ToolOutput, delta: StateDelta) -> Self {
        Self {
            output,
            delta: Some(delta),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::output(ToolOutput::Error(message.into()))
    }

    pub fn disabled(reason: impl Into<String>) -> Self {
        Self::output(ToolOutput::Disabled {
            reason: reason.into(),
        })
    }
}

/// Context passed to tools during execution
pub struct ToolContext<'a> {
    /// State as it stands after every earlier call in the same batch.
    pub state: &'a AgentState,
    /// Reflection cycle rather than a user turn.
    pub autonomous: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g., "write_journal")
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome>;

    fn kind(&self) -> ToolKind {
        ToolKind::Standard
    }
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub kind: ToolKind,
    pub outcome: ToolOutcome,
}

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registered tool: {} ({:?})", name, tool.kind());
        self.tools.write().await.insert(name, tool);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names = self.tools.read().await.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Unknown tools are treated as standard.
    pub async fn kind_of(&self, name: &str) -> ToolKind {
        self.get(name)
            .await
            .map(|tool| tool.kind())
            .unwrap_or(ToolKind::Standard)
    }

    /// OpenAI-format tool definitions, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        let mut defs = tools
            .values()
            .map(|tool| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect::<Vec<_>>();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute one call. Handler errors become `ToolOutput::Error`.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> ToolCallResult {
        let Some(tool) = self.get(&call.name).await else {
            return ToolCallResult {
                id: call.id.clone(),
                name: call.name.clone(),
                kind: ToolKind::Standard,
                outcome: ToolOutcome::error(format!("Unknown tool: {}", call.name)),
            };
        };

        let outcome = match tool.execute(call.arguments.clone(), ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Tool '{}' failed: {:#}", call.name, e);
                ToolOutcome::error(format!("Tool execution failed: {:#}", e))
            }
        };
        ToolCallResult {
            id: call.id.clone(),
            name: call.name.clone(),
            kind: tool.kind(),
            outcome,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with every built-in tool. Integrations read their endpoints
/// from `config` and report themselves disabled when unset.
pub async fn builtin_registry(config: &AgentConfig) -> Result<ToolRegistry> {
    let registry = ToolRegistry::new();
    for tool in cognition::tools() {
        registry.register(tool).await;
    }
    for tool in files::tools() {
        registry.register(tool).await;
    }
    for tool in integrations::tools(config)? {
        registry.register(tool).await;
    }
    tracing::info!(
        "Tool registry ready: {}",
        registry.list_names().await.join(", ")
    );
    Ok(registry)
}

pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .with_context(|| format!("Missing required '{}' parameter", key))
}

pub(crate) fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes back the input message"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "The message to echo" }
                },
                "required": ["message"]
            })
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
            let message = required_str(&params, "message")?;
            Ok(ToolOutcome::output(ToolOutput::Text(message.to_string())))
        }
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_execute_echo_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let state = AgentState::seed("Ada");
        let ctx = ToolContext {
            state: &state,
            autonomous: false,
        };

        let result = registry
            .execute_call(&call("echo", json!({"message": "hello"})), &ctx)
            .await;
        assert_eq!(result.id, "call_1");
        assert_eq!(result.outcome.output, ToolOutput::Text("hello".to_string()));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_output() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;
        let state = AgentState::seed("Ada");
        let ctx = ToolContext {
            state: &state,
            autonomous: false,
        };

        let result = registry.execute_call(&call("echo", json!({})), &ctx).await;
        assert!(!result.outcome.output.is_success());
        assert!(result.outcome.output.to_response_value()["error"]
            .as_str()
            .unwrap()
            .contains("message"));
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_error() {
        let registry = ToolRegistry::new();
        let state = AgentState::seed("Ada");
        let ctx = ToolContext {
            state: &state,
            autonomous: true,
        };
        let result = registry.execute_call(&call("nope", json!({})), &ctx).await;
        assert!(matches!(result.outcome.output, ToolOutput::Error(_)));
        assert_eq!(result.kind, ToolKind::Standard);
    }

    #[tokio::test]
    async fn test_builtin_definitions_are_sorted_and_complete() {
        let registry = builtin_registry(&AgentConfig::default()).await.unwrap();
        let defs = registry.tool_definitions().await;
        let names = defs
            .iter()
            .map(|def| def.function.name.as_str())
            .collect::<Vec<_>>();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        for expected in [
            "write_journal",
            "update_weights",
            "write_file",
            "list_directory",
            "web_search",
            "generate_image",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert_eq!(registry.kind_of("web_search").await, ToolKind::Grounding);
        assert_eq!(registry.kind_of("generate_image").await, ToolKind::Generative);
        assert!(defs.iter().all(|def| def.tool_type == "function"));
    }
}
