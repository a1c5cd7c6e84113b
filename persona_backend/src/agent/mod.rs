//! The persona agent: owns the in-memory state, gates it behind the boot
//! protocol and drives interactive and autonomous turns.

pub mod cadence;
pub mod prompt;
pub mod turn_loop;

use flume::Sender;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use crate::config::AgentConfig;
use crate::llm_client::{ModelClient, ModelSelection};
use crate::state::mutations::StateDelta;
use crate::state::{
    ActivityStatus, AgentState, ChatTurn, JournalEntry, JournalKind, Phase,
};
use crate::store::debounce::SaveDebouncer;
use crate::store::migration::{self, BootDecision, BootOutcome};
use crate::store::{BackupManager, KvStore, StateStore};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StatusChanged {
        phase: Phase,
        status: ActivityStatus,
    },
    TurnAppended {
        turn: ChatTurn,
    },
    /// Progress for long-running generative tools.
    Interim {
        tool: String,
        message: String,
    },
    JournalWritten {
        entry: JournalEntry,
    },
    DecisionRequired {
        backups: Vec<String>,
    },
    Observation {
        message: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BootGate {
    Pending,
    Ready,
    AwaitingDecision { backups: Vec<String> },
    Failed { reason: String },
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("a turn is already in progress")]
    Busy,
    #[error("agent unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("message has neither text nor attachment")]
    EmptyMessage,
    #[error("turn aborted after {iterations} model calls without a final answer")]
    LoopAborted { iterations: usize },
    #[error("model call failed: {0:#}")]
    Model(anyhow::Error),
    #[error("{0:#}")]
    Store(anyhow::Error),
}

/// Phase and status, the two inputs of the autonomy condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activity {
    pub phase: Phase,
    pub status: ActivityStatus,
}

impl Activity {
    fn of(state: &AgentState) -> Self {
        Self {
            phase: state.meta.phase,
            status: state.meta.status,
        }
    }

    pub fn autonomy_active(&self) -> bool {
        self.phase == Phase::Operational && self.status != ActivityStatus::Uncomfortable
    }
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub text: String,
    pub attachment: Option<Attachment>,
}

/// Held for the duration of one turn; releases the processing flag on drop.
pub struct ProcessingGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

struct Persistence {
    store: Arc<StateStore>,
    backups: BackupManager,
    debouncer: Arc<SaveDebouncer>,
}

pub struct Agent {
    config: AgentConfig,
    state: Arc<RwLock<AgentState>>,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn ModelClient>,
    selection: ModelSelection,
    persistence: Option<Persistence>,
    gate: RwLock<BootGate>,
    processing: Arc<AtomicBool>,
    event_tx: Sender<AgentEvent>,
    activity_tx: watch::Sender<Activity>,
}

impl Agent {
    /// `kv = None` runs the agent without persistence.
    pub fn new(
        config: AgentConfig,
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        kv: Option<Arc<dyn KvStore>>,
        event_tx: Sender<AgentEvent>,
    ) -> Self {
        let placeholder = AgentState::seed(&config.persona_name);
        let (activity_tx, _) = watch::channel(Activity::of(&placeholder));
        let state = Arc::new(RwLock::new(placeholder));

        let persistence = kv.map(|kv| {
            let store = Arc::new(StateStore::new(kv.clone()));
            Persistence {
                debouncer: Arc::new(SaveDebouncer::new(
                    store.clone(),
                    state.clone(),
                    Duration::from_millis(config.save_debounce_ms),
                )),
                backups: BackupManager::new(kv, config.backup_cap),
                store,
            }
        });
        if persistence.is_none() {
            tracing::warn!("Key-value credentials missing; running without persistence");
        }

        Self {
            selection: ModelSelection::from_config(&config),
            config,
            state,
            tools,
            model,
            persistence,
            gate: RwLock::new(BootGate::Pending),
            processing: Arc::new(AtomicBool::new(false)),
            event_tx,
            activity_tx,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub async fn gate(&self) -> BootGate {
        self.gate.read().await.clone()
    }

    pub async fn snapshot(&self) -> AgentState {
        self.state.read().await.clone()
    }

    pub fn subscribe_activity(&self) -> watch::Receiver<Activity> {
        self.activity_tx.subscribe()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    fn notify_activity(&self, state: &AgentState) {
        let activity = Activity::of(state);
        let changed = self.activity_tx.send_if_modified(|current| {
            if *current == activity {
                false
            } else {
                *current = activity;
                true
            }
        });
        if changed {
            self.emit(AgentEvent::StatusChanged {
                phase: activity.phase,
                status: activity.status,
            });
        }
    }

    /// Run the boot protocol and open the gate if a state is available.
    pub async fn boot(&self) -> BootGate {
        let Some(persistence) = &self.persistence else {
            let seed = AgentState::seed(&self.config.persona_name);
            self.install_state(seed, "Booted without persistence.").await;
            return self.gate().await;
        };

        match migration::boot(&persistence.store, &persistence.backups, &self.config.persona_name)
            .await
        {
            Ok(BootOutcome::Loaded(state)) => {
                self.install_state(state, "Loaded persisted state.").await
            }
            Ok(BootOutcome::Migrated { state, tombstone }) => {
                let note = format!("Migrated legacy state (original kept at {}).", tombstone);
                self.install_state(state, &note).await
            }
            Ok(BootOutcome::Seeded(state)) => {
                self.install_state(state, "Cold boot from the canonical seed.")
                    .await
            }
            Ok(BootOutcome::DecisionRequired { backups }) => {
                *self.gate.write().await = BootGate::AwaitingDecision {
                    backups: backups.clone(),
                };
                self.emit(AgentEvent::DecisionRequired { backups });
            }
            Err(e) => {
                tracing::error!("Boot failed: {:#}", e);
                *self.gate.write().await = BootGate::Failed {
                    reason: format!("{:#}", e),
                };
                self.emit(AgentEvent::Error {
                    message: format!("Boot failed: {:#}", e),
                });
            }
        }
        self.gate().await
    }

    pub async fn retry_boot(&self) -> Result<BootGate, TurnError> {
        match self.gate().await {
            BootGate::Failed { .. } | BootGate::Pending => Ok(self.boot().await),
            other => Err(TurnError::Unavailable {
                reason: format!("boot is not retryable from {:?}", other),
            }),
        }
    }

    /// Resolve the restore-vs-fresh decision raised during boot.
    pub async fn resolve_boot(&self, decision: BootDecision) -> Result<BootGate, TurnError> {
        let BootGate::AwaitingDecision { .. } = self.gate().await else {
            return Err(TurnError::Unavailable {
                reason: "no boot decision is pending".to_string(),
            });
        };
        let persistence = self.persistence.as_ref().ok_or_else(|| TurnError::Unavailable {
            reason: "persistence disabled".to_string(),
        })?;

        let note = match &decision {
            BootDecision::Restore { .. } => "Restored from backup after boot decision.",
            BootDecision::StartFresh => "Started fresh after boot decision.",
        };
        let state = migration::resolve(
            &persistence.store,
            &persistence.backups,
            &self.config.persona_name,
            decision,
        )
        .await
        .map_err(TurnError::Store)?;
        self.install_state(state, note).await;
        Ok(self.gate().await)
    }

    /// Replace the live state with a backup. Equivalent to a cold boot with
    /// pre-seeded content.
    pub async fn restore_backup(&self, key: &str) -> Result<(), TurnError> {
        let _guard = self.begin_turn().await?;
        let persistence = self.persistence.as_ref().ok_or_else(|| TurnError::Unavailable {
            reason: "persistence disabled".to_string(),
        })?;
        // The granular keys are wiped and reloaded below; no timed save may
        // land in between or after with the pre-restore state.
        let _saving = persistence
            .debouncer
            .hold()
            .await
            .map_err(TurnError::Store)?;

        let state = migration::recover_from_backup(
            &persistence.store,
            &persistence.backups,
            &self.config.persona_name,
            key,
        )
        .await
        .map_err(TurnError::Store)?;
        self.install_state(state, "Restored from backup on request.")
            .await;
        Ok(())
    }

    pub async fn snapshot_backup(&self) -> Result<String, TurnError> {
        let persistence = self.persistence.as_ref().ok_or_else(|| TurnError::Unavailable {
            reason: "persistence disabled".to_string(),
        })?;
        let state = self.state.read().await.clone();
        persistence
            .backups
            .snapshot(&state)
            .await
            .map_err(TurnError::Store)
    }

    pub async fn list_backups(&self) -> Result<Vec<String>, TurnError> {
        let persistence = self.persistence.as_ref().ok_or_else(|| TurnError::Unavailable {
            reason: "persistence disabled".to_string(),
        })?;
        persistence
            .backups
            .list()
            .await
            .map_err(TurnError::Store)
    }

    /// Swap in a booted state, enter the operational phase and open the gate.
    async fn install_state(&self, state: AgentState, note: &str) {
        {
            let mut current = self.state.write().await;
            *current = state;

            let mut delta = StateDelta::default();
            if current.meta.phase == Phase::Booting {
                current.meta.phase = Phase::Operational;
                delta = delta.with_journal(
                    JournalKind::System,
                    format!("{} Entering operational phase.", note),
                );
            } else {
                delta = delta.with_journal(JournalKind::System, note);
            }
            // A crash mid-turn can leave a transient status behind.
            if matches!(
                current.meta.status,
                ActivityStatus::Conversing | ActivityStatus::Reflecting | ActivityStatus::Acting
            ) {
                delta.status = Some(ActivityStatus::Idle);
            }
            let entries = delta.journal.clone();
            current.apply(delta);
            for entry in entries {
                self.emit(AgentEvent::JournalWritten { entry });
            }
            self.notify_activity(&current);
        }
        *self.gate.write().await = BootGate::Ready;
        tracing::info!("{}", note);
        self.emit(AgentEvent::Observation {
            message: note.to_string(),
        });
        self.persist_now().await;
    }

    /// Claim the processing flag. Fails when the gate is closed or another
    /// turn holds it.
    pub async fn begin_turn(&self) -> Result<ProcessingGuard, TurnError> {
        match self.gate().await {
            BootGate::Ready => {}
            other => {
                return Err(TurnError::Unavailable {
                    reason: format!("boot state is {:?}", other),
                })
            }
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TurnError::Busy);
        }
        Ok(ProcessingGuard {
            flag: self.processing.clone(),
        })
    }

    /// Fold a delta into the live state and announce its journal entries.
    pub(crate) async fn apply_delta(&self, delta: StateDelta) {
        if delta.is_empty() {
            return;
        }
        let entries = delta.journal.clone();
        {
            let mut state = self.state.write().await;
            state.apply(delta);
            self.notify_activity(&state);
        }
        for entry in entries {
            self.emit(AgentEvent::JournalWritten { entry });
        }
    }

    pub(crate) async fn set_status(&self, status: ActivityStatus) {
        let mut state = self.state.write().await;
        if state.meta.status != status {
            state.meta.status = status;
            self.notify_activity(&state);
        }
    }

    pub(crate) async fn append_turn(&self, turn: ChatTurn) {
        self.state.write().await.chat_history.push(turn.clone());
        self.emit(AgentEvent::TurnAppended { turn });
    }

    /// Delta-save now. Failures are surfaced, not retried; the watermark
    /// stays behind so the next save carries the missed changes.
    pub(crate) async fn persist_now(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let result = {
            let state = self.state.read().await;
            persistence.store.save_delta(&state).await
        };
        if let Err(e) = result {
            tracing::warn!("Persisting state failed: {:#}", e);
            self.emit(AgentEvent::Error {
                message: format!("Saving failed: {:#}", e),
            });
        }
    }

    /// Coalesced save for high-frequency mutations.
    pub(crate) async fn persist_debounced(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.debouncer.schedule().await;
        }
    }

    /// Flush pending writes; call before process exit.
    pub async fn shutdown(&self) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.debouncer.flush().await {
                tracing::error!("Final save failed: {:#}", e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::llm_client::scripted::ScriptedModel;
    use crate::llm_client::ModelResponse;
    use crate::state::mutations::write_file;
    use crate::store::{KvCommand, KvReply, MemoryKv};

    #[tokio::test]
    async fn cold_boot_opens_gate_and_enters_operational_phase() {
        let h = booted(ScriptedModel::new(vec![])).await;
        let state = h.agent.snapshot().await;
        assert_eq!(state.meta.phase, Phase::Operational);
        assert!(state.journal.iter().all(|e| e.kind == JournalKind::System));

        let reloaded = StateStore::new(h.kv.clone());
        assert_eq!(reloaded.load().await.unwrap().unwrap(), state);
        assert_eq!(*h.agent.subscribe_activity().borrow(), Activity::of(&state));
    }

    #[tokio::test]
    async fn backups_without_primary_hold_the_gate_until_decided() {
        let h = harness_with(ScriptedModel::new(vec![]), AgentConfig::default()).await;
        let backups = BackupManager::new(h.kv.clone(), 20);
        let mut old = AgentState::seed("Old");
        old.chat_history.push(ChatTurn::user_text("remember me"));
        let key = backups.snapshot(&old).await.unwrap();

        let gate = h.agent.boot().await;
        assert_eq!(
            gate,
            BootGate::AwaitingDecision {
                backups: vec![key.clone()]
            }
        );
        assert!(matches!(
            h.agent.begin_turn().await,
            Err(TurnError::Unavailable { .. })
        ));
        assert!(h
            .events
            .drain()
            .any(|event| matches!(event, AgentEvent::DecisionRequired { .. })));

        let gate = h
            .agent
            .resolve_boot(BootDecision::Restore { key: Some(key) })
            .await
            .unwrap();
        assert_eq!(gate, BootGate::Ready);
        let state = h.agent.snapshot().await;
        assert_eq!(state.chat_history.len(), 1);
        assert!(state.journal.iter().any(|e| e.event.contains("Recovered from backup")));
    }

    #[tokio::test]
    async fn failed_boot_can_be_retried() {
        let h = harness_with(ScriptedModel::new(vec![]), AgentConfig::default()).await;
        h.kv.set_offline(true);
        assert!(matches!(h.agent.boot().await, BootGate::Failed { .. }));
        h.kv.set_offline(false);
        assert_eq!(h.agent.retry_boot().await.unwrap(), BootGate::Ready);
        assert!(h.agent.retry_boot().await.is_err());
    }

    #[tokio::test]
    async fn second_turn_while_processing_is_rejected() {
        let h = booted(ScriptedModel::repeating(ModelResponse::text("hi"))).await;
        let guard = h.agent.begin_turn().await.unwrap();
        assert!(matches!(h.agent.begin_turn().await, Err(TurnError::Busy)));
        drop(guard);
        assert!(h.agent.begin_turn().await.is_ok());
    }

    #[tokio::test]
    async fn runs_without_persistence() {
        let (tx, _rx) = flume::unbounded();
        let config = AgentConfig::default();
        let tools = Arc::new(crate::tools::builtin_registry(&config).await.unwrap());
        let agent = Agent::new(
            config,
            Arc::new(ScriptedModel::new(vec![])),
            tools,
            None,
            tx,
        );
        assert_eq!(agent.boot().await, BootGate::Ready);
        assert!(!agent.persistence_enabled());
        assert!(agent.list_backups().await.is_err());
    }

    struct SlowKv {
        inner: Arc<MemoryKv>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl KvStore for SlowKv {
        async fn pipeline(&self, commands: Vec<KvCommand>) -> anyhow::Result<Vec<KvReply>> {
            tokio::time::sleep(self.delay).await;
            self.inner.pipeline(commands).await
        }
    }

    #[tokio::test]
    async fn decay_during_restore_cannot_overwrite_the_restored_state() {
        let kv = Arc::new(MemoryKv::new());
        let mut config = AgentConfig::default();
        config.persona_name = "Ada".to_string();
        config.save_debounce_ms = 10;
        let tools = Arc::new(crate::tools::builtin_registry(&config).await.unwrap());
        let (tx, _rx) = flume::unbounded();
        let agent = Arc::new(Agent::new(
            config,
            Arc::new(ScriptedModel::new(vec![])),
            tools,
            Some(Arc::new(SlowKv {
                inner: kv.clone(),
                delay: Duration::from_millis(60),
            }) as Arc<dyn KvStore>),
            tx,
        ));
        assert_eq!(agent.boot().await, BootGate::Ready);
        agent
            .apply_delta(write_file("/notes/plan.md", "keep me"))
            .await;
        agent.persist_now().await;
        let before = agent.snapshot().await;
        let key = agent.snapshot_backup().await.unwrap();

        let restoring = tokio::spawn({
            let agent = agent.clone();
            let key = key.clone();
            async move { agent.restore_backup(&key).await }
        });
        tokio::time::sleep(Duration::from_millis(90)).await;
        agent.decay_energy(1.0).await;
        restoring.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let live = agent.snapshot().await;
        assert!(live.journal.starts_with(&before.journal));
        assert_eq!(
            live.virtual_file_system.get("/notes/plan.md").map(String::as_str),
            Some("keep me")
        );
        assert_eq!(live.goals, before.goals);
        assert!(kv.raw_string(crate::store::adapter::keys::LEGACY_STATE).is_none());
        assert_eq!(StateStore::new(kv.clone()).load().await.unwrap().unwrap(), live);
    }

    #[tokio::test]
    async fn restore_backup_replaces_live_state() {
        let h = booted(ScriptedModel::repeating(ModelResponse::text("ok"))).await;
        let key = h.agent.snapshot_backup().await.unwrap();
        h.agent
            .send_message(UserInput {
                text: "after the snapshot".to_string(),
                attachment: None,
            })
            .await
            .unwrap();
        assert_eq!(h.agent.snapshot().await.chat_history.len(), 2);

        h.agent.restore_backup(&key).await.unwrap();
        let state = h.agent.snapshot().await;
        assert!(state.chat_history.is_empty());
        assert!(state
            .journal
            .iter()
            .any(|e| e.event == format!("Recovered from backup {}.", key)));
        assert!(!h.agent.is_processing());
    }
}
