//! The turn loop: model call, tool dispatch, repeat until the model answers.

use crate::llm_client::ModelRequest;
use crate::state::mutations::StateDelta;
use crate::state::{ActivityStatus, ChatTurn, JournalKind, Part, Role};
use crate::tools::{ToolCall, ToolCallResult, ToolContext, ToolKind, ToolOutput};

use super::prompt::{self, TurnMode};
use super::{Agent, AgentEvent, ProcessingGuard, TurnError, UserInput};

const REFLECTION_PROMPT: &str = "Reflect on your recent performance. Review your journal, goals \
and resources, then use your tools to record what you learned, adjust your value weights or \
update your goals. Respond only through tool calls.";

/// Where the turns of one loop go: the persisted chat history, or a
/// transcript that lives only for the duration of a reflection cycle.
enum Transcript {
    Live,
    Transient(Vec<ChatTurn>),
}

impl Transcript {
    async fn history(&self, agent: &Agent) -> Vec<ChatTurn> {
        match self {
            Transcript::Live => agent.state.read().await.chat_history.clone(),
            Transcript::Transient(turns) => turns.clone(),
        }
    }

    async fn push(&mut self, agent: &Agent, turn: ChatTurn) {
        match self {
            Transcript::Live => agent.append_turn(turn).await,
            Transcript::Transient(turns) => turns.push(turn),
        }
    }
}

/// How a loop ended without error.
enum LoopEnd {
    /// The model replied without tool calls.
    Answered(ChatTurn),
    /// A grounding tool produced the final turn, already appended.
    Grounded,
}

fn latest_user_turn(history: &[ChatTurn]) -> Option<&ChatTurn> {
    history
        .iter()
        .rev()
        .find(|turn| turn.role == Role::User && !turn.has_tool_results())
}

fn call_turn(calls: &[ToolCall]) -> ChatTurn {
    ChatTurn {
        role: Role::Model,
        parts: calls
            .iter()
            .map(|call| Part::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args: call.arguments.clone(),
            })
            .collect(),
        grounding_refs: Vec::new(),
    }
}

fn media_turn(result: &ToolCallResult) -> Option<ChatTurn> {
    let ToolOutput::Media {
        mime_type,
        data,
        caption,
    } = &result.outcome.output
    else {
        return None;
    };
    let mut parts = Vec::new();
    if let Some(caption) = caption.as_ref().filter(|c| !c.trim().is_empty()) {
        parts.push(Part::Text {
            text: caption.clone(),
        });
    }
    parts.push(Part::InlineData {
        mime_type: mime_type.clone(),
        data: data.clone(),
    });
    Some(ChatTurn {
        role: Role::Model,
        parts,
        grounding_refs: Vec::new(),
    })
}

fn grounded_turn(result: &ToolCallResult) -> ChatTurn {
    match &result.outcome.output {
        ToolOutput::Grounded { text, refs } => ChatTurn {
            grounding_refs: refs.clone(),
            ..ChatTurn::model_text(text.clone())
        },
        ToolOutput::Disabled { reason } => ChatTurn::model_text(format!(
            "I wanted to look that up, but {} is not available: {}",
            result.name, reason
        )),
        ToolOutput::Error(error) => ChatTurn::model_text(format!(
            "I tried to look that up, but the search failed: {}",
            error
        )),
        other => ChatTurn::model_text(other.to_response_value().to_string()),
    }
}

impl Agent {
    /// Validate, claim the processing flag and run a full user turn.
    pub async fn send_message(&self, input: UserInput) -> Result<Option<ChatTurn>, TurnError> {
        if input.text.trim().is_empty() && input.attachment.is_none() {
            return Err(TurnError::EmptyMessage);
        }
        let guard = self.begin_turn().await?;
        self.handle_user_message(guard, input).await
    }

    /// Run a user turn with an already claimed processing flag. Returns the
    /// final model turn, if the model produced one.
    pub async fn handle_user_message(
        &self,
        _guard: ProcessingGuard,
        input: UserInput,
    ) -> Result<Option<ChatTurn>, TurnError> {
        let mut parts = Vec::new();
        if !input.text.trim().is_empty() {
            parts.push(Part::Text { text: input.text });
        }
        if let Some(attachment) = input.attachment {
            parts.push(Part::InlineData {
                mime_type: attachment.mime_type,
                data: attachment.data,
            });
        }
        if parts.is_empty() {
            return Err(TurnError::EmptyMessage);
        }

        self.append_turn(ChatTurn {
            role: Role::User,
            parts,
            grounding_refs: Vec::new(),
        })
        .await;
        self.set_status(ActivityStatus::Conversing).await;
        // The user turn is durable before the first model call.
        self.persist_now().await;

        let mut transcript = Transcript::Live;
        match self.run_loop(TurnMode::Interactive, &mut transcript).await {
            Ok(end) => {
                let final_turn = match end {
                    LoopEnd::Answered(turn)
                        if !turn.text().trim().is_empty()
                            || turn.inline_mime_types().next().is_some() =>
                    {
                        self.append_turn(turn.clone()).await;
                        Some(turn)
                    }
                    LoopEnd::Answered(_) => {
                        tracing::debug!("Model ended the turn with an empty response; nothing appended");
                        None
                    }
                    LoopEnd::Grounded => self.state.read().await.chat_history.last().cloned(),
                };
                self.set_status(ActivityStatus::Idle).await;
                self.persist_now().await;
                Ok(final_turn)
            }
            Err(e) => {
                self.record_failure(TurnMode::Interactive, &e).await;
                Err(e)
            }
        }
    }

    /// One autonomous reflection cycle over a transient transcript. Any
    /// free text the model ends with is kept as a reflection journal entry.
    pub async fn reflect(&self) -> Result<Option<String>, TurnError> {
        let _guard = self.begin_turn().await?;
        if !self.state.read().await.is_autonomy_active() {
            return Err(TurnError::Unavailable {
                reason: "autonomy is paused".to_string(),
            });
        }
        tracing::info!("Starting reflection cycle");
        self.set_status(ActivityStatus::Reflecting).await;

        let mut transcript = Transcript::Transient(vec![ChatTurn::user_text(REFLECTION_PROMPT)]);
        match self.run_loop(TurnMode::Reflective, &mut transcript).await {
            Ok(end) => {
                let text = match end {
                    LoopEnd::Answered(turn) => Some(turn.text()),
                    LoopEnd::Grounded => None,
                }
                .filter(|text| !text.trim().is_empty());
                if let Some(text) = &text {
                    self.apply_delta(StateDelta::journal(JournalKind::Reflection, text.clone()))
                        .await;
                }
                self.set_status(ActivityStatus::Idle).await;
                self.persist_now().await;
                Ok(text)
            }
            Err(e) => {
                self.record_failure(TurnMode::Reflective, &e).await;
                Err(e)
            }
        }
    }

    async fn run_loop(
        &self,
        mode: TurnMode,
        transcript: &mut Transcript,
    ) -> Result<LoopEnd, TurnError> {
        let tool_defs = self.tools.tool_definitions().await;
        let max_iterations = self.config.max_turn_iterations.max(1);

        for iteration in 1..=max_iterations {
            let history = transcript.history(self).await;
            let system_prompt = {
                let state = self.state.read().await;
                prompt::render_system_prompt(&state, mode)
            };
            let model = self.selection.pick(latest_user_turn(&history));
            tracing::debug!(
                "Model call {} ({} turns, model {})",
                iteration,
                history.len(),
                model
            );

            let response = self
                .model
                .generate(ModelRequest {
                    model,
                    system_prompt: &system_prompt,
                    history: &history,
                    tools: &tool_defs,
                })
                .await
                .map_err(TurnError::Model)?;

            if response.tool_calls.is_empty() {
                let turn = ChatTurn {
                    grounding_refs: response.grounding_refs,
                    ..ChatTurn::model_text(response.text.unwrap_or_default())
                };
                return Ok(LoopEnd::Answered(turn));
            }

            let calls = response.tool_calls;
            transcript.push(self, call_turn(&calls)).await;

            if mode == TurnMode::Interactive {
                if let Some(call) = self.first_grounding_call(&calls).await {
                    if calls.len() > 1 {
                        tracing::debug!(
                            "Grounding call '{}' ends the turn; skipping {} other call(s)",
                            call.name,
                            calls.len() - 1
                        );
                    }
                    let result = self.execute_one(call, mode).await;
                    transcript.push(self, grounded_turn(&result)).await;
                    return Ok(LoopEnd::Grounded);
                }
            }

            let mut result_parts = Vec::with_capacity(calls.len());
            let mut media_turns = Vec::new();
            for call in &calls {
                let result = self.execute_one(call, mode).await;
                result_parts.push(Part::ToolResult {
                    id: result.id.clone(),
                    name: result.name.clone(),
                    response: result.outcome.output.to_response_value(),
                });
                media_turns.extend(media_turn(&result));
            }

            transcript
                .push(
                    self,
                    ChatTurn {
                        role: Role::User,
                        parts: result_parts,
                        grounding_refs: Vec::new(),
                    },
                )
                .await;
            for turn in media_turns {
                transcript.push(self, turn).await;
            }
            self.persist_now().await;
        }

        Err(TurnError::LoopAborted {
            iterations: max_iterations,
        })
    }

    async fn first_grounding_call<'c>(&self, calls: &'c [ToolCall]) -> Option<&'c ToolCall> {
        for call in calls {
            if self.tools.kind_of(&call.name).await == ToolKind::Grounding {
                return Some(call);
            }
        }
        None
    }

    /// Execute one call against the state as it stands now, then fold its
    /// delta in so the next call sees it.
    async fn execute_one(&self, call: &ToolCall, mode: TurnMode) -> ToolCallResult {
        if self.tools.kind_of(&call.name).await == ToolKind::Generative {
            self.emit(AgentEvent::Interim {
                tool: call.name.clone(),
                message: format!("Generating with {}...", call.name),
            });
        }

        let snapshot = self.state.read().await.clone();
        let ctx = ToolContext {
            state: &snapshot,
            autonomous: mode == TurnMode::Reflective,
        };
        let mut result = self.tools.execute_call(call, &ctx).await;
        tracing::debug!(
            "Tool '{}' finished (success: {})",
            call.name,
            result.outcome.output.is_success()
        );
        if let Some(delta) = result.outcome.delta.take() {
            self.apply_delta(delta).await;
        }
        result
    }

    /// Orchestrator failure: uncomfortable status, a scar, an apology in
    /// the chat for user turns. Nothing is retried.
    async fn record_failure(&self, mode: TurnMode, error: &TurnError) {
        let scar = match error {
            TurnError::LoopAborted { iterations } => format!(
                "Turn loop aborted after {} model calls without a final answer.",
                iterations
            ),
            other => format!("Turn failed: {}", other),
        };
        tracing::error!("{}", scar);

        let delta = StateDelta {
            status: Some(ActivityStatus::Uncomfortable),
            ..StateDelta::journal(JournalKind::Scar, scar.clone())
        };
        self.apply_delta(delta).await;
        if mode == TurnMode::Interactive {
            self.append_turn(ChatTurn::model_text(
                "I'm sorry, something went wrong while I was working on that. \
                 I've noted it in my journal.",
            ))
            .await;
        }
        self.persist_now().await;
        self.emit(AgentEvent::Error { message: scar });
    }
}
