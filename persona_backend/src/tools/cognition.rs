//! Tools over the persona's own cognitive state: journal, self/kinship
//! models, value weights, goals, projections, affect and energy.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::state::mutations::{
    add_capability, edit_belief, remove_capability, set_goal_status, update_weights,
    BeliefTarget, StateDelta,
};
use crate::state::{
    Affect, CausalProjection, Goal, GoalStatus, JournalKind, Resources, ValueWeights,
};

use super::{optional_str, required_str, Tool, ToolContext, ToolOutcome, ToolOutput};

pub fn tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(WriteJournalTool),
        Arc::new(CapabilityTool { add: true }),
        Arc::new(CapabilityTool { add: false }),
        Arc::new(BeliefTool { add: true }),
        Arc::new(BeliefTool { add: false }),
        Arc::new(UpdateWeightsTool),
        Arc::new(SetGoalStatusTool),
        Arc::new(ProposeGoalTool),
        Arc::new(RecordProjectionTool),
        Arc::new(SetAffectTool),
        Arc::new(RechargeTool),
    ]
}

fn text(message: impl Into<String>) -> ToolOutput {
    ToolOutput::Text(message.into())
}

pub struct WriteJournalTool;

#[async_trait]
impl Tool for WriteJournalTool {
    fn name(&self) -> &str {
        "write_journal"
    }

    fn description(&self) -> &str {
        "Append an entry to your permanent journal. Entries are never edited or removed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "event": { "type": "string", "description": "What happened or what you concluded" },
                "kind": {
                    "type": "string",
                    "enum": ["interaction", "reflection", "summary"],
                    "description": "Entry kind (default: reflection when autonomous, interaction otherwise)"
                }
            },
            "required": ["event"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let event = required_str(&params, "event")?;
        let kind = match optional_str(&params, "kind") {
            Some("interaction") => JournalKind::Interaction,
            Some("reflection") => JournalKind::Reflection,
            Some("summary") => JournalKind::Summary,
            Some(other) => {
                return Ok(ToolOutcome::error(format!(
                    "Unsupported journal kind '{}'",
                    other
                )))
            }
            None if ctx.autonomous => JournalKind::Reflection,
            None => JournalKind::Interaction,
        };
        Ok(ToolOutcome::with_delta(
            text("Journal entry recorded."),
            StateDelta::journal(kind, event),
        ))
    }
}

pub struct CapabilityTool {
    add: bool,
}

#[async_trait]
impl Tool for CapabilityTool {
    fn name(&self) -> &str {
        if self.add {
            "add_capability"
        } else {
            "remove_capability"
        }
    }

    fn description(&self) -> &str {
        if self.add {
            "Add a capability to your self-model."
        } else {
            "Remove a capability from your self-model."
        }
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "capability": { "type": "string", "description": "Capability name" }
            },
            "required": ["capability"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let capability = required_str(&params, "capability")?;
        let delta = if self.add {
            add_capability(ctx.state, capability)
        } else {
            remove_capability(ctx.state, capability)
        };
        let changed = delta.self_model.is_some();
        Ok(ToolOutcome::with_delta(
            ToolOutput::Json(json!({ "capability": capability, "changed": changed })),
            delta,
        ))
    }
}

pub struct BeliefTool {
    add: bool,
}

#[async_trait]
impl Tool for BeliefTool {
    fn name(&self) -> &str {
        if self.add {
            "add_belief"
        } else {
            "remove_belief"
        }
    }

    fn description(&self) -> &str {
        if self.add {
            "Add a belief about yourself or about the person you talk with (kinship)."
        } else {
            "Remove a belief about yourself or about the person you talk with (kinship)."
        }
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "belief": { "type": "string" },
                "about": {
                    "type": "string",
                    "enum": ["self", "kinship"],
                    "description": "Which model to edit (default self)"
                }
            },
            "required": ["belief"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let belief = required_str(&params, "belief")?;
        let target = match optional_str(&params, "about") {
            None | Some("self") => BeliefTarget::SelfModel,
            Some("kinship") => BeliefTarget::Kinship,
            Some(other) => {
                return Ok(ToolOutcome::error(format!(
                    "'about' must be 'self' or 'kinship', got '{}'",
                    other
                )))
            }
        };
        let delta = edit_belief(ctx.state, target, belief, self.add);
        let changed = delta.self_model.is_some() || delta.kinship_model.is_some();
        Ok(ToolOutcome::with_delta(
            ToolOutput::Json(json!({ "belief": belief, "changed": changed })),
            delta,
        ))
    }
}

pub struct UpdateWeightsTool;

#[async_trait]
impl Tool for UpdateWeightsTool {
    fn name(&self) -> &str {
        "update_weights"
    }

    fn description(&self) -> &str {
        "Adjust your value weights. Give any subset of dimensions; the full vector is renormalized to sum to 1."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "weights": {
                    "type": "object",
                    "description": "Dimension name to non-negative weight",
                    "additionalProperties": { "type": "number" }
                }
            },
            "required": ["weights"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let raw = params
            .get("weights")
            .and_then(Value::as_object)
            .context("'weights' must be an object of numbers")?;
        let mut partial = ValueWeights::new();
        for (dimension, value) in raw {
            let value = value
                .as_f64()
                .with_context(|| format!("Weight for '{}' must be a number", dimension))?;
            partial.insert(dimension.clone(), value);
        }

        match update_weights(&ctx.state.meta.weights, &partial) {
            Ok(weights) => {
                let summary = weights
                    .iter()
                    .map(|(dimension, value)| format!("{}={:.3}", dimension, value))
                    .collect::<Vec<_>>()
                    .join(", ");
                let delta = StateDelta {
                    weights: Some(weights.clone()),
                    ..StateDelta::default()
                }
                .with_journal(JournalKind::System, format!("Value weights now {}.", summary));
                Ok(ToolOutcome::with_delta(
                    ToolOutput::Json(json!({ "weights": weights })),
                    delta,
                ))
            }
            Err(e) => Ok(ToolOutcome::error(e.to_string())),
        }
    }
}

fn parse_goal_status(raw: &str) -> Option<GoalStatus> {
    match raw {
        "proposed" => Some(GoalStatus::Proposed),
        "active" => Some(GoalStatus::Active),
        "completed" => Some(GoalStatus::Completed),
        "failed" => Some(GoalStatus::Failed),
        _ => None,
    }
}

pub struct SetGoalStatusTool;

#[async_trait]
impl Tool for SetGoalStatusTool {
    fn name(&self) -> &str {
        "set_goal_status"
    }

    fn description(&self) -> &str {
        "Change the status of one of your goals by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "status": { "type": "string", "enum": ["proposed", "active", "completed", "failed"] }
            },
            "required": ["id", "status"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let id = required_str(&params, "id")?;
        let raw_status = required_str(&params, "status")?;
        let Some(status) = parse_goal_status(raw_status) else {
            return Ok(ToolOutcome::error(format!(
                "Unknown goal status '{}'",
                raw_status
            )));
        };

        match set_goal_status(&ctx.state.goals, id, status) {
            Some(goals) => Ok(ToolOutcome::with_delta(
                text(format!("Goal '{}' is now {}.", id, raw_status)),
                StateDelta {
                    goals: Some(goals),
                    ..StateDelta::default()
                },
            )),
            None => Ok(ToolOutcome::error(format!(
                "No goal with id '{}'; nothing changed.",
                id
            ))),
        }
    }
}

pub struct ProposeGoalTool;

#[async_trait]
impl Tool for ProposeGoalTool {
    fn name(&self) -> &str {
        "propose_goal"
    }

    fn description(&self) -> &str {
        "Propose a new goal for yourself. It starts in the 'proposed' status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "description": { "type": "string" },
                "priority": { "type": "integer", "minimum": 1, "maximum": 5 }
            },
            "required": ["description"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let description = required_str(&params, "description")?;
        let priority = params
            .get("priority")
            .and_then(Value::as_u64)
            .unwrap_or(3)
            .clamp(1, 5) as u8;
        let id = format!("goal-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let mut goals = ctx.state.goals.clone();
        goals.push(Goal {
            id: id.clone(),
            description: description.to_string(),
            status: GoalStatus::Proposed,
            priority,
        });
        Ok(ToolOutcome::with_delta(
            ToolOutput::Json(json!({ "id": id, "status": "proposed" })),
            StateDelta {
                goals: Some(goals),
                ..StateDelta::default()
            }
            .with_journal(
                JournalKind::System,
                format!("Proposed goal {}: {}", id, description),
            ),
        ))
    }
}

pub struct RecordProjectionTool;

#[async_trait]
impl Tool for RecordProjectionTool {
    fn name(&self) -> &str {
        "record_projection"
    }

    fn description(&self) -> &str {
        "Record a causal projection: an action you might take and the outcome you predict."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string" },
                "predicted_outcome": { "type": "string" },
                "confidence": { "type": "number", "minimum": 0, "maximum": 1 }
            },
            "required": ["action", "predicted_outcome", "confidence"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let action = required_str(&params, "action")?;
        let predicted_outcome = required_str(&params, "predicted_outcome")?;
        let confidence = params
            .get("confidence")
            .and_then(Value::as_f64)
            .context("'confidence' must be a number")?
            .clamp(0.0, 1.0);

        Ok(ToolOutcome::with_delta(
            text("Projection recorded."),
            StateDelta {
                projections: vec![CausalProjection {
                    action: action.to_string(),
                    predicted_outcome: predicted_outcome.to_string(),
                    confidence,
                }],
                ..StateDelta::default()
            },
        ))
    }
}

pub struct SetAffectTool;

#[async_trait]
impl Tool for SetAffectTool {
    fn name(&self) -> &str {
        "set_affect"
    }

    fn description(&self) -> &str {
        "Update your current affective state."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "state": { "type": "string", "description": "e.g. curious, content, uneasy" },
                "intensity": { "type": "number", "minimum": 0, "maximum": 1 },
                "focus": { "type": "string", "description": "What the feeling is about" }
            },
            "required": ["state", "intensity"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let state = required_str(&params, "state")?;
        let intensity = params
            .get("intensity")
            .and_then(Value::as_f64)
            .context("'intensity' must be a number")?;
        let focus = optional_str(&params, "focus").unwrap_or(ctx.state.meta.affect.focus.as_str());
        let affect = Affect::new(state, intensity, focus);

        Ok(ToolOutcome::with_delta(
            ToolOutput::Json(json!({ "affect": affect })),
            StateDelta {
                affect: Some(affect),
                ..StateDelta::default()
            },
        ))
    }
}

pub struct RechargeTool;

#[async_trait]
impl Tool for RechargeTool {
    fn name(&self) -> &str {
        "recharge"
    }

    fn description(&self) -> &str {
        "Restore your energy to full. Energy never recovers on its own."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext<'_>) -> Result<ToolOutcome> {
        let before = ctx.state.meta.resources.energy;
        let resources = Resources {
            energy: 100.0,
            ..ctx.state.meta.resources.clone()
        };
        Ok(ToolOutcome::with_delta(
            text("Energy restored to 100."),
            StateDelta {
                resources: Some(resources),
                ..StateDelta::default()
            }
            .with_journal(
                JournalKind::System,
                format!("Recharged energy from {:.1} to 100.", before),
            ),
        ))
    }
}
