//! Granular mapping of `AgentState` onto key-value keys.
//!
//! The adapter remembers what it last persisted (the watermark) so that a
//! delta save only carries the meta blob, the new tails of append-only
//! lists, the goal list and changed files. Persisting a mutation never costs
//! O(chat history).

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::state::{AgentState, CausalProjection, ChatTurn, Goal, JournalEntry, Meta};

use super::{KvCommand, KvStore};

pub mod keys {
    pub const META: &str = "persona:meta";
    pub const JOURNAL: &str = "persona:journal";
    pub const CHAT_HISTORY: &str = "persona:chat_history";
    pub const GOALS: &str = "persona:goals";
    pub const CAUSAL_PROJECTIONS: &str = "persona:causal_projections";
    pub const FILES: &str = "persona:vfs";
    pub const LEGACY_STATE: &str = "persona:state";
    pub const BACKUP_INDEX: &str = "persona:backups";

    /// Every key that makes up the granular layout.
    pub const GRANULAR: [&str; 6] = [META, JOURNAL, CHAT_HISTORY, GOALS, CAUSAL_PROJECTIONS, FILES];
}

/// What the store currently holds, as far as this process knows.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedMark {
    pub meta: Meta,
    pub journal_len: usize,
    pub chat_len: usize,
    pub goals: Vec<Goal>,
    pub projections_len: usize,
    pub files: BTreeMap<String, String>,
}

impl PersistedMark {
    pub fn of(state: &AgentState) -> Self {
        Self {
            meta: state.meta.clone(),
            journal_len: state.journal.len(),
            chat_len: state.chat_history.len(),
            goals: state.goals.clone(),
            projections_len: state.causal_projections.len(),
            files: state.virtual_file_system.clone(),
        }
    }
}

pub struct StateStore {
    kv: Arc<dyn KvStore>,
    mark: Mutex<Option<PersistedMark>>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            mark: Mutex::new(None),
        }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Load the granular state in one batch. `Ok(None)` means no meta key;
    /// transport and decode failures are errors, never an empty state.
    pub async fn load(&self) -> Result<Option<AgentState>> {
        let mut replies = self
            .kv
            .pipeline(vec![
                KvCommand::Get(keys::META.to_string()),
                KvCommand::LRange(keys::JOURNAL.to_string(), 0, -1),
                KvCommand::LRange(keys::CHAT_HISTORY.to_string(), 0, -1),
                KvCommand::LRange(keys::GOALS.to_string(), 0, -1),
                KvCommand::LRange(keys::CAUSAL_PROJECTIONS.to_string(), 0, -1),
                KvCommand::HGetAll(keys::FILES.to_string()),
            ])
            .await
            .context("Failed to load persona state")?
            .into_iter();

        let mut next = || replies.next().context("Load batch returned too few replies");
        let Some(meta_raw) = next()?.into_text() else {
            return Ok(None);
        };
        let meta: Meta = serde_json::from_str(&meta_raw).context("Corrupt meta blob")?;
        let journal: Vec<JournalEntry> = decode_list(next()?.into_list()?, keys::JOURNAL)?;
        let chat_history: Vec<ChatTurn> = decode_list(next()?.into_list()?, keys::CHAT_HISTORY)?;
        let goals: Vec<Goal> = decode_list(next()?.into_list()?, keys::GOALS)?;
        let causal_projections: Vec<CausalProjection> =
            decode_list(next()?.into_list()?, keys::CAUSAL_PROJECTIONS)?;
        let virtual_file_system = next()?.into_hash()?;

        let state = AgentState {
            meta,
            journal,
            chat_history,
            goals,
            causal_projections,
            virtual_file_system,
        };
        *self.mark.lock().await = Some(PersistedMark::of(&state));
        tracing::debug!(
            "Loaded persona state (journal: {}, chat: {}, files: {})",
            state.journal.len(),
            state.chat_history.len(),
            state.virtual_file_system.len()
        );
        Ok(Some(state))
    }

    /// Rewrite every granular key from `state`.
    pub async fn save_all(&self, state: &AgentState) -> Result<()> {
        let commands = granular_write_commands(state)?;
        tracing::debug!("Full state save: {} command(s)", commands.len());
        self.kv
            .pipeline(commands)
            .await
            .context("Failed to save full persona state")?;
        *self.mark.lock().await = Some(PersistedMark::of(state));
        Ok(())
    }

    /// Persist only what changed since the watermark. Returns the number of
    /// commands sent (0 when nothing changed).
    pub async fn save_delta(&self, state: &AgentState) -> Result<usize> {
        let mut mark = self.mark.lock().await;
        let Some(previous) = mark.as_ref() else {
            drop(mark);
            let count = granular_write_commands(state)?.len();
            self.save_all(state).await?;
            return Ok(count);
        };

        let commands = delta_commands(previous, state)?;
        if commands.is_empty() {
            return Ok(0);
        }
        let count = commands.len();
        tracing::debug!("Delta save: {} command(s)", count);
        self.kv
            .pipeline(commands)
            .await
            .context("Failed to persist state delta")?;
        *mark = Some(PersistedMark::of(state));
        Ok(count)
    }

    pub async fn append_journal(&self, entries: &[JournalEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.kv
            .exec(KvCommand::RPush(
                keys::JOURNAL.to_string(),
                encode_list(entries)?,
            ))
            .await
            .context("Failed to append journal entries")?;
        if let Some(mark) = self.mark.lock().await.as_mut() {
            mark.journal_len += entries.len();
        }
        Ok(())
    }

    pub async fn append_chat(&self, turns: &[ChatTurn]) -> Result<()> {
        if turns.is_empty() {
            return Ok(());
        }
        self.kv
            .exec(KvCommand::RPush(
                keys::CHAT_HISTORY.to_string(),
                encode_list(turns)?,
            ))
            .await
            .context("Failed to append chat turns")?;
        if let Some(mark) = self.mark.lock().await.as_mut() {
            mark.chat_len += turns.len();
        }
        Ok(())
    }

    pub async fn replace_goals(&self, goals: &[Goal]) -> Result<()> {
        self.kv
            .pipeline(goal_commands(goals)?)
            .await
            .context("Failed to replace goals")?;
        if let Some(mark) = self.mark.lock().await.as_mut() {
            mark.goals = goals.to_vec();
        }
        Ok(())
    }

    pub async fn set_file(&self, path: &str, content: &str) -> Result<()> {
        self.kv
            .exec(KvCommand::HSet(
                keys::FILES.to_string(),
                vec![(path.to_string(), content.to_string())],
            ))
            .await
            .with_context(|| format!("Failed to write file '{}'", path))?;
        if let Some(mark) = self.mark.lock().await.as_mut() {
            mark.files.insert(path.to_string(), content.to_string());
        }
        Ok(())
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.kv
            .exec(KvCommand::HDel(keys::FILES.to_string(), vec![path.to_string()]))
            .await
            .with_context(|| format!("Failed to delete file '{}'", path))?;
        if let Some(mark) = self.mark.lock().await.as_mut() {
            mark.files.remove(path);
        }
        Ok(())
    }

    /// Forget the watermark, e.g. after the granular keys were wiped by a
    /// restore.
    pub async fn reset_mark(&self) {
        *self.mark.lock().await = None;
    }
}

/// Commands that rewrite the complete granular layout for `state`.
pub fn granular_write_commands(state: &AgentState) -> Result<Vec<KvCommand>> {
    let mut commands = vec![KvCommand::Set(
        keys::META.to_string(),
        serde_json::to_string(&state.meta).context("Failed to encode meta")?,
    )];
    push_list(&mut commands, keys::JOURNAL, &state.journal)?;
    push_list(&mut commands, keys::CHAT_HISTORY, &state.chat_history)?;
    push_list(&mut commands, keys::GOALS, &state.goals)?;
    push_list(&mut commands, keys::CAUSAL_PROJECTIONS, &state.causal_projections)?;
    commands.push(KvCommand::Del(keys::FILES.to_string()));
    if !state.virtual_file_system.is_empty() {
        commands.push(KvCommand::HSet(
            keys::FILES.to_string(),
            state
                .virtual_file_system
                .iter()
                .map(|(path, content)| (path.clone(), content.clone()))
                .collect(),
        ));
    }
    Ok(commands)
}

/// Commands that bring the store from `mark` to `state`.
pub fn delta_commands(mark: &PersistedMark, state: &AgentState) -> Result<Vec<KvCommand>> {
    let mut commands = Vec::new();

    if mark.meta != state.meta {
        commands.push(KvCommand::Set(
            keys::META.to_string(),
            serde_json::to_string(&state.meta).context("Failed to encode meta")?,
        ));
    }
    push_tail(&mut commands, keys::JOURNAL, mark.journal_len, &state.journal)?;
    push_tail(
        &mut commands,
        keys::CHAT_HISTORY,
        mark.chat_len,
        &state.chat_history,
    )?;
    if mark.goals != state.goals {
        commands.extend(goal_commands(&state.goals)?);
    }
    push_tail(
        &mut commands,
        keys::CAUSAL_PROJECTIONS,
        mark.projections_len,
        &state.causal_projections,
    )?;

    let changed = state
        .virtual_file_system
        .iter()
        .filter(|(path, content)| mark.files.get(*path) != Some(*content))
        .map(|(path, content)| (path.clone(), content.clone()))
        .collect::<Vec<_>>();
    if !changed.is_empty() {
        commands.push(KvCommand::HSet(keys::FILES.to_string(), changed));
    }
    let removed = mark
        .files
        .keys()
        .filter(|path| !state.virtual_file_system.contains_key(*path))
        .cloned()
        .collect::<Vec<_>>();
    if !removed.is_empty() {
        commands.push(KvCommand::HDel(keys::FILES.to_string(), removed));
    }

    Ok(commands)
}

fn goal_commands(goals: &[Goal]) -> Result<Vec<KvCommand>> {
    let mut commands = Vec::new();
    push_list(&mut commands, keys::GOALS, goals)?;
    Ok(commands)
}

fn push_list<T: Serialize>(commands: &mut Vec<KvCommand>, key: &str, items: &[T]) -> Result<()> {
    commands.push(KvCommand::Del(key.to_string()));
    if !items.is_empty() {
        commands.push(KvCommand::RPush(key.to_string(), encode_list(items)?));
    }
    Ok(())
}

fn push_tail<T: Serialize>(
    commands: &mut Vec<KvCommand>,
    key: &str,
    persisted_len: usize,
    items: &[T],
) -> Result<()> {
    if items.len() < persisted_len {
        bail!(
            "append-only list '{}' shrank from {} to {} entries",
            key,
            persisted_len,
            items.len()
        );
    }
    if items.len() > persisted_len {
        commands.push(KvCommand::RPush(
            key.to_string(),
            encode_list(&items[persisted_len..])?,
        ));
    }
    Ok(())
}

fn encode_list<T: Serialize>(items: &[T]) -> Result<Vec<String>> {
    items
        .iter()
        .map(|item| serde_json::to_string(item).context("Failed to encode list entry"))
        .collect()
}

fn decode_list<T: DeserializeOwned>(raw: Vec<String>, key: &str) -> Result<Vec<T>> {
    raw.iter()
        .enumerate()
        .map(|(idx, item)| {
            serde_json::from_str(item)
                .with_context(|| format!("Corrupt entry {} in list '{}'", idx, key))
        })
        .collect()
}
