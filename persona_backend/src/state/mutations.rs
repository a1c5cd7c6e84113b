//! Pure transforms over `AgentState`.
//!
//! Helpers compute a `StateDelta` from the current state and the requested
//! change; `AgentState::apply` folds a delta in. Both interactive and
//! autonomous turns go through these.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use thiserror::Error;

use super::{
    ActivityStatus, Affect, AgentState, CausalProjection, Goal, GoalStatus, JournalEntry,
    JournalKind, KinshipModel, Resources, SelfModel, ValueWeights,
};

const WEIGHT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("weight update would leave every value dimension at zero")]
    ZeroWeightSum,
    #[error("invalid weight {value} for dimension '{dimension}' (must be finite and >= 0)")]
    InvalidWeight { dimension: String, value: f64 },
}

/// A requested change to the state. Journal entries and projections are
/// appended; every `Some` field replaces the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub journal: Vec<JournalEntry>,
    pub status: Option<ActivityStatus>,
    pub affect: Option<Affect>,
    pub resources: Option<Resources>,
    pub weights: Option<ValueWeights>,
    pub self_model: Option<SelfModel>,
    pub kinship_model: Option<KinshipModel>,
    pub goals: Option<Vec<Goal>>,
    pub projections: Vec<CausalProjection>,
    pub files_written: Vec<(String, String)>,
    pub files_deleted: Vec<String>,
    pub products: Option<Vec<Value>>,
    pub orders: Option<Vec<Value>>,
    pub collections: Option<Vec<Value>>,
    pub pages: Option<Vec<Value>>,
}

impl StateDelta {
    pub fn journal(kind: JournalKind, event: impl Into<String>) -> Self {
        Self {
            journal: vec![JournalEntry::new(kind, event)],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn with_journal(mut self, kind: JournalKind, event: impl Into<String>) -> Self {
        self.journal.push(JournalEntry::new(kind, event));
        self
    }
}

impl AgentState {
    pub fn apply(&mut self, delta: StateDelta) {
        self.journal.extend(delta.journal);
        if let Some(status) = delta.status {
            self.meta.status = status;
        }
        if let Some(affect) = delta.affect {
            self.meta.affect = affect;
        }
        if let Some(resources) = delta.resources {
            self.set_resources(resources);
        }
        if let Some(weights) = delta.weights {
            self.meta.weights = weights;
        }
        if let Some(self_model) = delta.self_model {
            self.meta.self_model = self_model;
        }
        if let Some(kinship_model) = delta.kinship_model {
            self.meta.kinship_model = kinship_model;
        }
        if let Some(goals) = delta.goals {
            self.goals = goals;
        }
        self.causal_projections.extend(delta.projections);
        for (path, content) in delta.files_written {
            self.virtual_file_system.insert(path, content);
        }
        for path in delta.files_deleted {
            self.virtual_file_system.remove(&path);
        }
        if let Some(products) = delta.products {
            self.meta.products = products;
        }
        if let Some(orders) = delta.orders {
            self.meta.orders = orders;
        }
        if let Some(collections) = delta.collections {
            self.meta.collections = collections;
        }
        if let Some(pages) = delta.pages {
            self.meta.pages = pages;
        }
    }
}

/// Add a capability. No-op on the model if already present; the attempt is
/// journaled either way.
pub fn add_capability(state: &AgentState, capability: &str) -> StateDelta {
    let capability = capability.trim();
    let mut delta = StateDelta::default();
    match insert_unique(&state.meta.self_model.capabilities, capability) {
        Some(capabilities) => {
            delta.self_model = Some(SelfModel {
                capabilities,
                ..state.meta.self_model.clone()
            });
            delta.with_journal(
                JournalKind::System,
                format!("Self-model: added capability '{}'.", capability),
            )
        }
        None => delta.with_journal(
            JournalKind::System,
            format!(
                "Self-model: capability '{}' already present, nothing added.",
                capability
            ),
        ),
    }
}

pub fn remove_capability(state: &AgentState, capability: &str) -> StateDelta {
    let capability = capability.trim();
    let mut delta = StateDelta::default();
    match remove_existing(&state.meta.self_model.capabilities, capability) {
        Some(capabilities) => {
            delta.self_model = Some(SelfModel {
                capabilities,
                ..state.meta.self_model.clone()
            });
            delta.with_journal(
                JournalKind::System,
                format!("Self-model: removed capability '{}'.", capability),
            )
        }
        None => delta.with_journal(
            JournalKind::System,
            format!(
                "Self-model: capability '{}' not present, nothing removed.",
                capability
            ),
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeliefTarget {
    SelfModel,
    Kinship,
}

pub fn edit_belief(state: &AgentState, target: BeliefTarget, belief: &str, add: bool) -> StateDelta {
    let belief = belief.trim();
    let current = match target {
        BeliefTarget::SelfModel => &state.meta.self_model.beliefs,
        BeliefTarget::Kinship => &state.meta.kinship_model.beliefs,
    };
    let updated = if add {
        insert_unique(current, belief)
    } else {
        remove_existing(current, belief)
    };
    let label = match target {
        BeliefTarget::SelfModel => "Self-model",
        BeliefTarget::Kinship => "Kinship model",
    };
    let verb = if add { "add" } else { "remove" };

    let mut delta = StateDelta::default();
    let Some(beliefs) = updated else {
        return delta.with_journal(
            JournalKind::System,
            format!("{}: {} belief '{}' was a no-op.", label, verb, belief),
        );
    };
    match target {
        BeliefTarget::SelfModel => {
            delta.self_model = Some(SelfModel {
                beliefs,
                ..state.meta.self_model.clone()
            })
        }
        BeliefTarget::Kinship => delta.kinship_model = Some(KinshipModel { beliefs }),
    }
    delta.with_journal(
        JournalKind::System,
        format!("{}: {} belief '{}'.", label, verb, belief),
    )
}

fn insert_unique(list: &[String], value: &str) -> Option<Vec<String>> {
    if value.is_empty() || list.iter().any(|item| item == value) {
        return None;
    }
    let mut updated = list.to_vec();
    updated.push(value.to_string());
    Some(updated)
}

fn remove_existing(list: &[String], value: &str) -> Option<Vec<String>> {
    if !list.iter().any(|item| item == value) {
        return None;
    }
    Some(list.iter().filter(|item| *item != value).cloned().collect())
}

/// Merge `partial` into `current` and renormalize so the vector sums to 1.0.
pub fn update_weights(
    current: &ValueWeights,
    partial: &ValueWeights,
) -> Result<ValueWeights, MutationError> {
    for (dimension, value) in partial {
        if !value.is_finite() || *value < 0.0 {
            return Err(MutationError::InvalidWeight {
                dimension: dimension.clone(),
                value: *value,
            });
        }
    }

    let mut merged = current.clone();
    for (dimension, value) in partial {
        merged.insert(dimension.clone(), *value);
    }

    let sum: f64 = merged.values().sum();
    if sum <= WEIGHT_EPSILON {
        return Err(MutationError::ZeroWeightSum);
    }
    for value in merged.values_mut() {
        *value /= sum;
    }
    Ok(merged)
}

/// Replace the status of goal `id`. `None` when no such goal exists.
pub fn set_goal_status(goals: &[Goal], id: &str, status: GoalStatus) -> Option<Vec<Goal>> {
    if !goals.iter().any(|goal| goal.id == id) {
        return None;
    }
    Some(
        goals
            .iter()
            .map(|goal| {
                if goal.id == id {
                    Goal {
                        status,
                        ..goal.clone()
                    }
                } else {
                    goal.clone()
                }
            })
            .collect(),
    )
}

pub fn read_file<'a>(files: &'a BTreeMap<String, String>, path: &str) -> Option<&'a str> {
    files.get(path).map(String::as_str)
}

pub fn write_file(path: &str, content: &str) -> StateDelta {
    StateDelta {
        files_written: vec![(path.to_string(), content.to_string())],
        ..StateDelta::default()
    }
}

pub fn delete_file(files: &BTreeMap<String, String>, path: &str) -> Option<StateDelta> {
    files.contains_key(path).then(|| StateDelta {
        files_deleted: vec![path.to_string()],
        ..StateDelta::default()
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    pub files: Vec<String>,
    pub directories: Vec<String>,
}

/// Children of `dir`, derived from path prefixes. Directories exist only as
/// shared prefixes of file paths.
pub fn list_directory(files: &BTreeMap<String, String>, dir: &str) -> DirectoryListing {
    let mut prefix = dir.trim().to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }

    let mut names = BTreeSet::new();
    let mut directories = BTreeSet::new();
    for path in files.keys() {
        let Some(rest) = path.strip_prefix(&prefix) else {
            continue;
        };
        match rest.find('/') {
            Some(idx) => {
                directories.insert(rest[..idx].to_string());
            }
            None if !rest.is_empty() => {
                names.insert(rest.to_string());
            }
            None => {}
        }
    }

    DirectoryListing {
        files: names.into_iter().collect(),
        directories: directories.into_iter().collect(),
    }
}
