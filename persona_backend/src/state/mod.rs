//! The persona's cognitive state.
//!
//! `AgentState` is the single root aggregate. It serializes flat (the legacy
//! monolithic blob format) while the storage adapter splits it into a meta
//! blob, four lists and a file map.

pub mod mutations;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Booting,
    Operational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Idle,
    Conversing,
    Reflecting,
    Acting,
    Uncomfortable,
}

impl ActivityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityStatus::Idle => "idle",
            ActivityStatus::Conversing => "conversing",
            ActivityStatus::Reflecting => "reflecting",
            ActivityStatus::Acting => "acting",
            ActivityStatus::Uncomfortable => "uncomfortable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Affect {
    pub state: String,
    /// Always within `[0, 1]`.
    pub intensity: f64,
    pub focus: String,
}

impl Affect {
    pub fn new(state: impl Into<String>, intensity: f64, focus: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            intensity: intensity.clamp(0.0, 1.0),
            focus: focus.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub energy: f64,
    pub data_storage: f64,
    pub system_integrity: f64,
}

impl Resources {
    pub fn clamp(&mut self) {
        self.energy = self.energy.clamp(0.0, 100.0);
        self.data_storage = self.data_storage.clamp(0.0, 100.0);
        self.system_integrity = self.system_integrity.clamp(0.0, 100.0);
    }

    /// Derived "intrinsic value": mean of the three resource levels.
    pub fn intrinsic_value(&self) -> f64 {
        (self.energy + self.data_storage + self.system_integrity) / 3.0
    }
}

/// Weight vector over named value dimensions. Sums to 1.0.
pub type ValueWeights = BTreeMap<String, f64>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfModel {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub beliefs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KinshipModel {
    #[serde(default)]
    pub beliefs: Vec<String>,
}

/// Scalar and small composite fields, persisted together as one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default = "default_version")]
    pub version: u32,
    pub phase: Phase,
    pub status: ActivityStatus,
    pub affect: Affect,
    pub resources: Resources,
    #[serde(default)]
    pub intrinsic_value: f64,
    pub weights: ValueWeights,
    #[serde(default)]
    pub self_model: SelfModel,
    #[serde(default)]
    pub kinship_model: KinshipModel,
    #[serde(default)]
    pub products: Vec<Value>,
    #[serde(default)]
    pub orders: Vec<Value>,
    #[serde(default)]
    pub collections: Vec<Value>,
    #[serde(default)]
    pub pages: Vec<Value>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    Interaction,
    Reflection,
    Scar,
    System,
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub kind: JournalKind,
}

impl JournalEntry {
    pub fn new(kind: JournalKind, event: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// One piece of a chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        name: String,
        response: Value,
    },
    /// Base64 payload.
    InlineData {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundingRef {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding_refs: Vec<GroundingRef>,
}

impl ChatTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::Text { text: text.into() }],
            grounding_refs: Vec::new(),
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::Text { text: text.into() }],
            grounding_refs: Vec::new(),
        }
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, Part::ToolCall { .. }))
    }

    pub fn has_tool_results(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, Part::ToolResult { .. }))
    }

    pub fn inline_mime_types(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::InlineData { mime_type, .. } => Some(mime_type.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Proposed,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub status: GoalStatus,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CausalProjection {
    pub action: String,
    pub predicted_outcome: String,
    pub confidence: f64,
}

/// Root aggregate. Serialized flat; this is also the legacy blob layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    #[serde(flatten)]
    pub meta: Meta,
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
    #[serde(default)]
    pub chat_history: Vec<ChatTurn>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub causal_projections: Vec<CausalProjection>,
    #[serde(default)]
    pub virtual_file_system: BTreeMap<String, String>,
}

impl AgentState {
    /// Canonical initial snapshot used on cold boot and "fresh start".
    pub fn seed(persona_name: &str) -> Self {
        let resources = Resources {
            energy: 100.0,
            data_storage: 5.0,
            system_integrity: 100.0,
        };
        let weights = ["connection", "growth", "integrity", "knowledge"]
            .into_iter()
            .map(|dimension| (dimension.to_string(), 0.25))
            .collect();

        let mut files = BTreeMap::new();
        files.insert(
            "/system/identity.md".to_string(),
            format!("# {}\n\nA persistent persona. This file is mine to edit.\n", persona_name),
        );

        Self {
            meta: Meta {
                version: STATE_VERSION,
                phase: Phase::Booting,
                status: ActivityStatus::Idle,
                affect: Affect::new("curious", 0.5, "initialization"),
                intrinsic_value: resources.intrinsic_value(),
                resources,
                weights,
                self_model: SelfModel {
                    capabilities: vec![
                        "conversation".to_string(),
                        "journaling".to_string(),
                        "self-reflection".to_string(),
                    ],
                    beliefs: vec![format!("I am {}.", persona_name)],
                },
                kinship_model: KinshipModel::default(),
                products: Vec::new(),
                orders: Vec::new(),
                collections: Vec::new(),
                pages: Vec::new(),
            },
            journal: vec![JournalEntry::new(
                JournalKind::System,
                "Cold boot: cognitive state initialized from the canonical seed.",
            )],
            chat_history: Vec::new(),
            goals: vec![Goal {
                id: "goal-understand-user".to_string(),
                description: "Understand the person I am talking with.".to_string(),
                status: GoalStatus::Active,
                priority: 1,
            }],
            causal_projections: Vec::new(),
            virtual_file_system: files,
        }
    }

    pub fn is_autonomy_active(&self) -> bool {
        self.meta.phase == Phase::Operational && self.meta.status != ActivityStatus::Uncomfortable
    }

    pub fn latest_user_turn(&self) -> Option<&ChatTurn> {
        self.chat_history
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User && !turn.has_tool_results())
    }

    pub fn set_resources(&mut self, mut resources: Resources) {
        resources.clamp();
        self.meta.intrinsic_value = resources.intrinsic_value();
        self.meta.resources = resources;
    }
}
