//! Legacy-blob migration and the cold-boot protocol.
//!
//! Boot order: granular state if present, else migrate the legacy blob, else
//! seed a fresh state, unless backups exist, in which case the caller has to
//! decide between restoring one and starting fresh.

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};

use crate::state::{AgentState, JournalEntry, JournalKind};

use super::adapter::{granular_write_commands, keys};
use super::{BackupManager, KvCommand, StateStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    AlreadyGranular,
    NoLegacy,
    Migrated { tombstone: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootOutcome {
    Loaded(AgentState),
    Migrated {
        state: AgentState,
        tombstone: String,
    },
    /// Fresh canonical seed, already persisted.
    Seeded(AgentState),
    /// No primary state but backups exist; nothing was written.
    DecisionRequired { backups: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootDecision {
    /// Restore the given backup, or the most recent one when `None`.
    Restore { key: Option<String> },
    StartFresh,
}

/// Split the legacy monolithic blob into the granular layout.
///
/// Granular writes, the tombstone copy and the legacy delete go out in one
/// batch. The tombstone holds the legacy bytes unchanged.
pub async fn migrate_legacy(store: &StateStore) -> Result<MigrationOutcome> {
    let mut replies = store
        .kv()
        .pipeline(vec![
            KvCommand::Exists(keys::META.to_string()),
            KvCommand::Get(keys::LEGACY_STATE.to_string()),
        ])
        .await
        .context("Failed to probe for legacy state")?
        .into_iter();

    let meta_exists = replies
        .next()
        .and_then(|reply| reply.as_integer())
        .unwrap_or_default()
        > 0;
    if meta_exists {
        return Ok(MigrationOutcome::AlreadyGranular);
    }
    let Some(raw) = replies.next().and_then(|reply| reply.into_text()) else {
        return Ok(MigrationOutcome::NoLegacy);
    };

    let state: AgentState =
        serde_json::from_str(&raw).context("Legacy state blob could not be decoded")?;
    let tombstone = format!(
        "{}:migrated:{}",
        keys::LEGACY_STATE,
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
    );

    let mut commands = granular_write_commands(&state)?;
    commands.push(KvCommand::Set(tombstone.clone(), raw));
    commands.push(KvCommand::Del(keys::LEGACY_STATE.to_string()));
    tracing::info!(
        "Migrating legacy state blob ({} command(s), tombstone {})",
        commands.len(),
        tombstone
    );
    store
        .kv()
        .pipeline(commands)
        .await
        .context("Failed to write migrated state")?;

    Ok(MigrationOutcome::Migrated { tombstone })
}

pub async fn boot(
    store: &StateStore,
    backups: &BackupManager,
    persona_name: &str,
) -> Result<BootOutcome> {
    if let Some(state) = store.load().await? {
        return Ok(BootOutcome::Loaded(state));
    }

    match migrate_legacy(store).await? {
        MigrationOutcome::Migrated { tombstone } => {
            let state = store
                .load()
                .await?
                .context("Migrated state vanished before it could be loaded")?;
            return Ok(BootOutcome::Migrated { state, tombstone });
        }
        MigrationOutcome::AlreadyGranular => {
            // Meta appeared between the load and the probe.
            if let Some(state) = store.load().await? {
                return Ok(BootOutcome::Loaded(state));
            }
        }
        MigrationOutcome::NoLegacy => {}
    }

    let available = backups.list().await?;
    if !available.is_empty() {
        tracing::warn!(
            "No primary state but {} backup(s) exist; waiting for a decision",
            available.len()
        );
        return Ok(BootOutcome::DecisionRequired { backups: available });
    }

    tracing::info!("Cold boot: seeding canonical state");
    let state = AgentState::seed(persona_name);
    store
        .save_all(&state)
        .await
        .context("Failed to persist seed state")?;
    Ok(BootOutcome::Seeded(state))
}

/// Resolve a pending boot decision.
pub async fn resolve(
    store: &StateStore,
    backups: &BackupManager,
    persona_name: &str,
    decision: BootDecision,
) -> Result<AgentState> {
    match decision {
        BootDecision::Restore { key } => {
            let key = match key {
                Some(key) => key,
                None => backups
                    .list()
                    .await?
                    .into_iter()
                    .next()
                    .context("No backups available to restore")?,
            };
            recover_from_backup(store, backups, persona_name, &key).await
        }
        BootDecision::StartFresh => {
            tracing::info!("Starting fresh; backups are kept");
            let state = AgentState::seed(persona_name);
            store
                .save_all(&state)
                .await
                .context("Failed to persist fresh state")?;
            Ok(state)
        }
    }
}

/// Replace the primary state with backup `key` and reload it through the
/// migration path. Destructive: no merge with the current state.
pub async fn recover_from_backup(
    store: &StateStore,
    backups: &BackupManager,
    persona_name: &str,
    key: &str,
) -> Result<AgentState> {
    backups.restore(key).await?;
    store.reset_mark().await;

    let mut state = match boot(store, backups, persona_name).await? {
        BootOutcome::Migrated { state, .. } | BootOutcome::Loaded(state) => state,
        other => bail!("Restore of '{}' did not reload a state: {:?}", key, other),
    };

    let entry = JournalEntry::new(JournalKind::System, format!("Recovered from backup {}.", key));
    store.append_journal(std::slice::from_ref(&entry)).await?;
    state.journal.push(entry);
    Ok(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::state::mutations::StateDelta;
    use crate::state::{ChatTurn, Phase};
    use crate::store::backup::DEFAULT_BACKUP_CAP;
    use crate::store::MemoryKv;

    fn setup() -> (Arc<MemoryKv>, StateStore, BackupManager) {
        let kv = Arc::new(MemoryKv::new());
        let store = StateStore::new(kv.clone());
        let backups = BackupManager::new(kv.clone(), DEFAULT_BACKUP_CAP);
        (kv, store, backups)
    }

    async fn write_legacy(kv: &MemoryKv, raw: &str) {
        use crate::store::KvStore;
        kv.exec(KvCommand::Set(keys::LEGACY_STATE.to_string(), raw.to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn migration_runs_once_and_tombstones_byte_identical_blob() {
        let (kv, store, _) = setup();
        let mut legacy = AgentState::seed("Ada");
        legacy.chat_history.push(ChatTurn::user_text("from the old days"));
        let raw = serde_json::to_string_pretty(&legacy).unwrap();
        write_legacy(&kv, &raw).await;
        kv.clear_recorded();

        let first = migrate_legacy(&store).await.unwrap();
        let MigrationOutcome::Migrated { tombstone } = first else {
            panic!("expected migration, got {:?}", first);
        };
        let writes_after_first = kv.recorded_batches().len();

        let second = migrate_legacy(&store).await.unwrap();
        assert_eq!(second, MigrationOutcome::AlreadyGranular);
        // the second run only probes
        assert_eq!(kv.recorded_batches().len(), writes_after_first + 1);

        assert!(kv.raw_string(keys::LEGACY_STATE).is_none());
        assert_eq!(kv.raw_string(&tombstone).unwrap(), raw);
        assert_eq!(store.load().await.unwrap().unwrap(), legacy);
    }

    #[tokio::test]
    async fn cold_boot_seeds_and_persists_before_returning() {
        let (_kv, store, backups) = setup();
        let outcome = boot(&store, &backups, "Ada").await.unwrap();
        let BootOutcome::Seeded(state) = outcome else {
            panic!("expected seed, got {:?}", outcome);
        };
        assert_eq!(state.meta.phase, Phase::Booting);
        assert_eq!(state.journal.len(), 1);
        assert_eq!(state.journal[0].kind, JournalKind::System);

        let reloaded = StateStore::new(store.kv().clone());
        assert_eq!(reloaded.load().await.unwrap().unwrap(), state);
    }

    #[tokio::test]
    async fn missing_primary_with_backups_requires_a_decision() {
        let (kv, store, backups) = setup();
        let key = backups.snapshot(&AgentState::seed("Ada")).await.unwrap();
        kv.clear_recorded();

        let outcome = boot(&store, &backups, "Ada").await.unwrap();
        assert_eq!(
            outcome,
            BootOutcome::DecisionRequired {
                backups: vec![key.clone()]
            }
        );
        assert!(!kv.keys().contains(&keys::META.to_string()));

        let fresh = resolve(&store, &backups, "Ada", BootDecision::StartFresh)
            .await
            .unwrap();
        assert_eq!(fresh.journal.len(), 1);
        assert_eq!(backups.list().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn restore_yields_snapshot_not_a_merge() {
        let (_kv, store, backups) = setup();
        let BootOutcome::Seeded(mut state) = boot(&store, &backups, "Ada").await.unwrap() else {
            panic!("expected cold boot");
        };
        state.chat_history.push(ChatTurn::user_text("before T1"));
        store.save_delta(&state).await.unwrap();
        let t1 = state.clone();
        let key = backups.snapshot(&t1).await.unwrap();

        state.chat_history.push(ChatTurn::user_text("after T1"));
        state.apply(StateDelta::journal(JournalKind::Interaction, "after T1"));
        store.save_delta(&state).await.unwrap();

        let restored = resolve(
            &store,
            &backups,
            "Ada",
            BootDecision::Restore { key: None },
        )
        .await
        .unwrap();

        assert_eq!(restored.chat_history, t1.chat_history);
        assert_eq!(restored.meta, t1.meta);
        assert_eq!(&restored.journal[..t1.journal.len()], &t1.journal[..]);
        assert_eq!(restored.journal.len(), t1.journal.len() + 1);
        assert!(restored.journal[t1.journal.len()].event.contains(&key));

        let reloaded = StateStore::new(store.kv().clone());
        assert_eq!(reloaded.load().await.unwrap().unwrap(), restored);
    }

    #[tokio::test]
    async fn transport_failure_during_boot_is_an_error() {
        let (kv, store, backups) = setup();
        kv.set_offline(true);
        assert!(boot(&store, &backups, "Ada").await.is_err());
    }
}
