//! Timestamped full-state snapshots under a capped, most-recent-first index.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tokio::sync::Mutex;

use crate::state::AgentState;

use super::adapter::keys;
use super::{KvCommand, KvStore};

pub const DEFAULT_BACKUP_CAP: usize = 20;
const BACKUP_PREFIX: &str = "backup:";

pub struct BackupManager {
    kv: Arc<dyn KvStore>,
    cap: usize,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl BackupManager {
    pub fn new(kv: Arc<dyn KvStore>, cap: usize) -> Self {
        Self {
            kv,
            cap: cap.max(1),
            last_stamp: Mutex::new(None),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Strictly increasing timestamp so two snapshots in the same instant
    /// never share a key.
    async fn next_key(&self) -> String {
        let mut last = self.last_stamp.lock().await;
        let mut stamp = Utc::now();
        if let Some(previous) = *last {
            if stamp <= previous {
                stamp = previous + Duration::nanoseconds(1);
            }
        }
        *last = Some(stamp);
        format!(
            "{}{}",
            BACKUP_PREFIX,
            stamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
        )
    }

    /// Write a full legacy-format copy of `state` and index it, evicting the
    /// oldest snapshots beyond the cap.
    pub async fn snapshot(&self, state: &AgentState) -> Result<String> {
        let key = self.next_key().await;
        let body = serde_json::to_string(state).context("Failed to encode backup snapshot")?;
        let cap = self.cap as i64;

        let replies = self
            .kv
            .pipeline(vec![
                KvCommand::Set(key.clone(), body),
                KvCommand::LPush(keys::BACKUP_INDEX.to_string(), vec![key.clone()]),
                KvCommand::LRange(keys::BACKUP_INDEX.to_string(), cap, -1),
                KvCommand::LTrim(keys::BACKUP_INDEX.to_string(), 0, cap - 1),
            ])
            .await
            .context("Failed to write backup snapshot")?;

        let evicted = replies
            .into_iter()
            .nth(2)
            .context("Backup batch returned too few replies")?
            .into_list()?;
        if !evicted.is_empty() {
            tracing::debug!("Evicting {} old backup(s)", evicted.len());
            self.kv
                .pipeline(evicted.into_iter().map(KvCommand::Del).collect())
                .await
                .context("Failed to delete evicted backups")?;
        }

        tracing::info!("Backup snapshot written: {}", key);
        Ok(key)
    }

    /// Backup keys, most recent first.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.kv
            .exec(KvCommand::LRange(keys::BACKUP_INDEX.to_string(), 0, -1))
            .await
            .context("Failed to list backups")?
            .into_list()
    }

    /// Replace the primary state with the snapshot under `key`.
    ///
    /// The snapshot is written back as the legacy blob and the granular keys
    /// are cleared, so the next boot re-normalizes it through migration.
    pub async fn restore(&self, key: &str) -> Result<()> {
        if !key.starts_with(BACKUP_PREFIX) {
            bail!("'{}' is not a backup key", key);
        }
        let Some(body) = self
            .kv
            .exec(KvCommand::Get(key.to_string()))
            .await
            .with_context(|| format!("Failed to read backup '{}'", key))?
            .into_text()
        else {
            bail!("Backup '{}' does not exist", key);
        };

        let mut commands = vec![KvCommand::Set(keys::LEGACY_STATE.to_string(), body)];
        commands.extend(
            keys::GRANULAR
                .iter()
                .map(|granular| KvCommand::Del(granular.to_string())),
        );
        self.kv
            .pipeline(commands)
            .await
            .with_context(|| format!("Failed to restore backup '{}'", key))?;
        tracing::warn!("Primary state replaced by backup {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::mutations::StateDelta;
    use crate::state::JournalKind;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn index_is_capped_and_evicts_oldest_first() {
        let kv = Arc::new(MemoryKv::new());
        let backups = BackupManager::new(kv.clone(), 4);
        let state = AgentState::seed("Ada");

        let mut written = Vec::new();
        for _ in 0..9 {
            written.push(backups.snapshot(&state).await.unwrap());
        }

        let listed = backups.list().await.unwrap();
        let mut expected = written[5..].to_vec();
        expected.reverse();
        assert_eq!(listed, expected);

        for evicted in &written[..5] {
            assert!(kv.raw_string(evicted).is_none());
        }
        for kept in &written[5..] {
            assert!(kv.raw_string(kept).is_some());
        }
    }

    #[tokio::test]
    async fn keys_are_unique_and_ordered() {
        let kv = Arc::new(MemoryKv::new());
        let backups = BackupManager::new(kv, DEFAULT_BACKUP_CAP);
        let state = AgentState::seed("Ada");
        let a = backups.snapshot(&state).await.unwrap();
        let b = backups.snapshot(&state).await.unwrap();
        assert_ne!(a, b);
        assert!(a < b);
        assert!(a.starts_with("backup:"));
    }

    #[tokio::test]
    async fn restore_writes_legacy_blob_and_clears_granular_keys() {
        let kv = Arc::new(MemoryKv::new());
        let store = crate::store::StateStore::new(kv.clone());
        let backups = BackupManager::new(kv.clone(), DEFAULT_BACKUP_CAP);

        let mut state = AgentState::seed("Ada");
        store.save_all(&state).await.unwrap();
        let key = backups.snapshot(&state).await.unwrap();
        let snapshot_body = kv.raw_string(&key).unwrap();

        state.apply(StateDelta::journal(JournalKind::Interaction, "after T1"));
        store.save_delta(&state).await.unwrap();

        backups.restore(&key).await.unwrap();
        assert_eq!(kv.raw_string(keys::LEGACY_STATE).unwrap(), snapshot_body);
        for granular in keys::GRANULAR {
            assert!(!kv.keys().contains(&granular.to_string()));
        }
    }

    #[tokio::test]
    async fn restoring_a_missing_backup_fails() {
        let kv = Arc::new(MemoryKv::new());
        let backups = BackupManager::new(kv, DEFAULT_BACKUP_CAP);
        assert!(backups.restore("backup:nope").await.is_err());
        assert!(backups.restore("persona:meta").await.is_err());
    }
}
