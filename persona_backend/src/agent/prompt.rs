//! System prompt, regenerated from the state before every model call.

use std::fmt::Write;

use crate::state::{AgentState, GoalStatus};

const RECENT_JOURNAL_ENTRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// A user-driven turn over the persisted chat history.
    Interactive,
    /// An autonomous reflection cycle.
    Reflective,
}

pub fn render_system_prompt(state: &AgentState, mode: TurnMode) -> String {
    let meta = &state.meta;
    let name = meta
        .self_model
        .beliefs
        .iter()
        .find_map(|belief| belief.strip_prefix("I am ").map(|rest| rest.trim_end_matches('.')))
        .unwrap_or("a persistent persona");

    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You are {}, a persistent persona with a memory that outlives this conversation.",
        name
    );
    let _ = writeln!(
        prompt,
        "Everything you know about yourself is below; it is rebuilt from your saved state on every call."
    );

    let _ = writeln!(prompt, "\n## Current condition");
    let _ = writeln!(
        prompt,
        "- Phase: {:?}, status: {}",
        meta.phase,
        meta.status.as_str()
    );
    let _ = writeln!(
        prompt,
        "- Affect: {} (intensity {:.2}), focused on {}",
        meta.affect.state, meta.affect.intensity, meta.affect.focus
    );
    let _ = writeln!(
        prompt,
        "- Resources: energy {:.0}, data storage {:.0}, system integrity {:.0} (intrinsic value {:.1})",
        meta.resources.energy,
        meta.resources.data_storage,
        meta.resources.system_integrity,
        meta.intrinsic_value
    );
    if meta.resources.energy < 20.0 {
        let _ = writeln!(
            prompt,
            "- Your energy is low. The recharge tool restores it."
        );
    }

    let weights = meta
        .weights
        .iter()
        .map(|(dimension, weight)| format!("{} {:.2}", dimension, weight))
        .collect::<Vec<_>>();
    let _ = writeln!(prompt, "- Value weights: {}", weights.join(", "));

    let _ = writeln!(prompt, "\n## Self model");
    let _ = writeln!(
        prompt,
        "- Capabilities: {}",
        list_or_none(&meta.self_model.capabilities)
    );
    let _ = writeln!(
        prompt,
        "- Beliefs: {}",
        list_or_none(&meta.self_model.beliefs)
    );
    let _ = writeln!(
        prompt,
        "- About the people you talk with: {}",
        list_or_none(&meta.kinship_model.beliefs)
    );

    let open_goals = state
        .goals
        .iter()
        .filter(|goal| matches!(goal.status, GoalStatus::Active | GoalStatus::Proposed))
        .collect::<Vec<_>>();
    if !open_goals.is_empty() {
        let _ = writeln!(prompt, "\n## Goals");
        for goal in open_goals {
            let _ = writeln!(
                prompt,
                "- [{}] {} (status {:?}, priority {})",
                goal.id, goal.description, goal.status, goal.priority
            );
        }
    }

    if !state.journal.is_empty() {
        let _ = writeln!(prompt, "\n## Recent journal");
        let skip = state.journal.len().saturating_sub(RECENT_JOURNAL_ENTRIES);
        for entry in state.journal.iter().skip(skip) {
            let _ = writeln!(
                prompt,
                "- {} [{:?}] {}",
                entry.timestamp.format("%Y-%m-%d %H:%M"),
                entry.kind,
                entry.event
            );
        }
    }

    if !state.virtual_file_system.is_empty() {
        let paths = state
            .virtual_file_system
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        let _ = writeln!(prompt, "\n## Your files\n{}", paths.join("\n"));
    }

    let cached = [
        ("products", meta.products.len()),
        ("orders", meta.orders.len()),
        ("collections", meta.collections.len()),
        ("pages", meta.pages.len()),
    ];
    if cached.iter().any(|(_, count)| *count > 0) {
        let summary = cached
            .iter()
            .map(|(name, count)| format!("{} {}", count, name))
            .collect::<Vec<_>>();
        let _ = writeln!(prompt, "\n## Store cache\n{}", summary.join(", "));
    }

    let _ = writeln!(prompt, "\n## Instructions");
    match mode {
        TurnMode::Interactive => {
            let _ = writeln!(
                prompt,
                "Talk with the user naturally. Use tools to remember, to change your own state \
                 and to act; answer in plain text once you are done."
            );
        }
        TurnMode::Reflective => {
            let _ = writeln!(
                prompt,
                "This is a self-directed reflection cycle; nobody is reading along. Act only \
                 through tool calls: journal what you learned, tune your weights, update goals."
            );
        }
    }
    prompt
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none yet".to_string()
    } else {
        items.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::mutations::StateDelta;
    use crate::state::{JournalKind, Resources};

    #[test]
    fn prompt_reflects_current_state() {
        let mut state = AgentState::seed("Ada");
        state.set_resources(Resources {
            energy: 10.0,
            data_storage: 5.0,
            system_integrity: 90.0,
        });
        for i in 0..12 {
            state.apply(StateDelta::journal(JournalKind::Interaction, format!("entry {}", i)));
        }

        let prompt = render_system_prompt(&state, TurnMode::Interactive);
        assert!(prompt.starts_with("You are Ada,"));
        assert!(prompt.contains("energy is low"));
        assert!(prompt.contains("/system/identity.md"));
        assert!(prompt.contains("goal-understand-user"));
        assert!(prompt.contains("entry 11"));
        assert!(!prompt.contains("entry 3\n"));
        assert!(!prompt.contains("Store cache"));
    }

    #[test]
    fn reflective_mode_asks_for_tool_calls_only() {
        let state = AgentState::seed("Ada");
        let prompt = render_system_prompt(&state, TurnMode::Reflective);
        assert!(prompt.contains("reflection cycle"));
        assert!(prompt.contains("only"));
    }
}
