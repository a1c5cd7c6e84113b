//! Autonomous cadence: energy decay and reflection timers that exist only
//! while autonomy is active, plus a wall-clock backup timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::AgentConfig;

use super::{Agent, BootGate, TurnError};

#[derive(Debug, Clone)]
pub struct CadenceSettings {
    pub decay_interval: Duration,
    pub decay_amount: f64,
    pub reflection_interval: Option<Duration>,
    pub backup_interval: Option<Duration>,
}

impl CadenceSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            decay_interval: Duration::from_secs(config.decay_interval_secs.max(1)),
            decay_amount: config.decay_amount.max(0.0),
            reflection_interval: config
                .enable_reflection
                .then(|| Duration::from_secs(config.reflection_interval_secs.max(1))),
            backup_interval: (config.backup_interval_secs > 0)
                .then(|| Duration::from_secs(config.backup_interval_secs)),
        }
    }
}

/// The decay and reflection tasks. Dropping them tears both down.
struct AutonomyTimers {
    decay: JoinHandle<()>,
    reflection: Option<JoinHandle<()>>,
}

impl AutonomyTimers {
    fn start(agent: &Arc<Agent>, settings: &CadenceSettings) -> Self {
        tracing::debug!("Autonomy active; starting cadence timers");
        Self {
            decay: tokio::spawn(decay_loop(
                agent.clone(),
                settings.decay_interval,
                settings.decay_amount,
            )),
            reflection: settings
                .reflection_interval
                .map(|interval| tokio::spawn(reflection_loop(agent.clone(), interval))),
        }
    }
}

impl Drop for AutonomyTimers {
    fn drop(&mut self) {
        tracing::debug!("Autonomy paused; stopping cadence timers");
        self.decay.abort();
        if let Some(reflection) = &self.reflection {
            reflection.abort();
        }
    }
}

pub struct CadenceHandle {
    supervisor: JoinHandle<()>,
    backup: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    timers_active: Arc<AtomicBool>,
}

impl CadenceHandle {
    /// Whether the decay/reflection timers currently exist.
    pub fn timers_active(&self) -> bool {
        self.timers_active.load(Ordering::SeqCst)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.supervisor.await {
            tracing::warn!("Cadence supervisor ended abnormally: {}", e);
        }
        if let Some(backup) = self.backup {
            backup.abort();
        }
    }
}

/// Start the cadence controller for `agent`.
pub fn spawn_cadence(agent: Arc<Agent>, settings: CadenceSettings) -> CadenceHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let timers_active = Arc::new(AtomicBool::new(false));

    let backup = settings
        .backup_interval
        .filter(|_| agent.persistence_enabled())
        .map(|interval| tokio::spawn(backup_loop(agent.clone(), interval)));

    let supervisor = tokio::spawn(supervise(
        agent,
        settings,
        shutdown_rx,
        timers_active.clone(),
    ));

    CadenceHandle {
        supervisor,
        backup,
        shutdown_tx,
        timers_active,
    }
}

/// Create the timers when autonomy becomes active and drop them as soon as
/// it stops being active.
async fn supervise(
    agent: Arc<Agent>,
    settings: CadenceSettings,
    mut shutdown: watch::Receiver<bool>,
    timers_active: Arc<AtomicBool>,
) {
    let mut activity = agent.subscribe_activity();
    let mut timers: Option<AutonomyTimers> = None;

    loop {
        let active = activity.borrow_and_update().autonomy_active();
        if active && timers.is_none() {
            timers = Some(AutonomyTimers::start(&agent, &settings));
        } else if !active {
            timers = None;
        }
        timers_active.store(timers.is_some(), Ordering::SeqCst);

        tokio::select! {
            changed = activity.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    drop(timers);
    timers_active.store(false, Ordering::SeqCst);
}

async fn decay_loop(agent: Arc<Agent>, interval: Duration, amount: f64) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        agent.decay_energy(amount).await;
    }
}

async fn reflection_loop(agent: Arc<Agent>, interval: Duration) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if agent.is_processing() {
            tracing::debug!("Skipping reflection: a turn is in progress");
            continue;
        }
        // Detached: a failing cycle pauses autonomy, which aborts this
        // loop, and the cycle must still finish recording its failure.
        let cycle = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.reflect().await })
        };
        match cycle.await {
            Ok(Ok(_)) => tracing::debug!("Reflection cycle complete"),
            Ok(Err(TurnError::Busy)) | Ok(Err(TurnError::Unavailable { .. })) => {}
            Ok(Err(e)) => tracing::warn!("Reflection cycle failed: {}", e),
            Err(e) => tracing::warn!("Reflection task panicked: {}", e),
        }
    }
}

async fn backup_loop(agent: Arc<Agent>, interval: Duration) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if agent.gate().await != BootGate::Ready {
            continue;
        }
        match agent.snapshot_backup().await {
            Ok(key) => tracing::info!("Scheduled backup written: {}", key),
            Err(e) => tracing::warn!("Scheduled backup failed: {}", e),
        }
    }
}

impl Agent {
    /// Drain `amount` energy, floored at 0. Energy is never replenished
    /// here; only the recharge tool restores it.
    pub async fn decay_energy(&self, amount: f64) {
        {
            let mut state = self.state.write().await;
            if !state.is_autonomy_active() {
                return;
            }
            let mut resources = state.meta.resources.clone();
            resources.energy = (resources.energy - amount).max(0.0);
            state.set_resources(resources);
        }
        self.persist_debounced().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::llm_client::scripted::ScriptedModel;
    use crate::llm_client::ModelResponse;
    use crate::state::{ActivityStatus, JournalKind};
    use crate::store::StateStore;

    fn settings(decay_ms: u64) -> CadenceSettings {
        CadenceSettings {
            decay_interval: Duration::from_millis(decay_ms),
            decay_amount: 5.0,
            reflection_interval: None,
            backup_interval: None,
        }
    }

    async fn energy(agent: &Agent) -> f64 {
        agent.snapshot().await.meta.resources.energy
    }

    #[test]
    fn settings_follow_config() {
        let mut config = AgentConfig::default();
        config.enable_reflection = false;
        config.backup_interval_secs = 0;
        let settings = CadenceSettings::from_config(&config);
        assert!(settings.reflection_interval.is_none());
        assert!(settings.backup_interval.is_none());
        assert_eq!(settings.decay_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn timers_stop_while_uncomfortable_and_resume_after() {
        let h = booted(ScriptedModel::new(vec![])).await;
        let cadence = spawn_cadence(h.agent.clone(), settings(20));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cadence.timers_active());
        let drained = energy(&h.agent).await;
        assert!(drained < 100.0);

        h.agent.set_status(ActivityStatus::Uncomfortable).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!cadence.timers_active());
        let paused = energy(&h.agent).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(energy(&h.agent).await, paused);

        h.agent.set_status(ActivityStatus::Idle).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cadence.timers_active());
        assert!(energy(&h.agent).await < paused);

        cadence.shutdown().await;
    }

    #[tokio::test]
    async fn decay_floors_at_zero_and_is_saved_on_shutdown() {
        let h = booted(ScriptedModel::new(vec![])).await;
        h.agent.decay_energy(60.0).await;
        h.agent.decay_energy(60.0).await;
        let state = h.agent.snapshot().await;
        assert_eq!(state.meta.resources.energy, 0.0);
        assert!((state.meta.intrinsic_value - (0.0 + 5.0 + 100.0) / 3.0).abs() < 1e-9);

        h.agent.shutdown().await;
        let persisted = StateStore::new(h.kv.clone()).load().await.unwrap().unwrap();
        assert_eq!(persisted.meta.resources.energy, 0.0);
    }

    #[tokio::test]
    async fn reflection_timer_drives_a_cycle() {
        let h = booted(ScriptedModel::repeating(ModelResponse::text("All is well."))).await;
        let cadence = spawn_cadence(
            h.agent.clone(),
            CadenceSettings {
                reflection_interval: Some(Duration::from_millis(30)),
                ..settings(10_000)
            },
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        cadence.shutdown().await;

        let state = h.agent.snapshot().await;
        assert!(state
            .journal
            .iter()
            .any(|e| e.kind == JournalKind::Reflection && e.event == "All is well."));
        assert!(state.chat_history.is_empty());
    }

    #[tokio::test]
    async fn backup_timer_snapshots_on_wall_clock() {
        let h = booted(ScriptedModel::new(vec![])).await;
        let cadence = spawn_cadence(
            h.agent.clone(),
            CadenceSettings {
                backup_interval: Some(Duration::from_millis(30)),
                ..settings(10_000)
            },
        );
        tokio::time::sleep(Duration::from_millis(110)).await;
        cadence.shutdown().await;
        assert!(!h.agent.list_backups().await.unwrap().is_empty());
    }
}
