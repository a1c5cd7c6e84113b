//! Coalesces rapid mutations into one delta save after a quiet period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;

use crate::state::AgentState;

use super::StateStore;

pub struct SaveDebouncer {
    store: Arc<StateStore>,
    state: Arc<RwLock<AgentState>>,
    delay: Duration,
    pending: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    save_lock: Mutex<()>,
}

impl SaveDebouncer {
    pub fn new(store: Arc<StateStore>, state: Arc<RwLock<AgentState>>, delay: Duration) -> Self {
        Self {
            store,
            state,
            delay,
            pending: AtomicBool::new(false),
            timer: Mutex::new(None),
            save_lock: Mutex::new(()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Mark the state dirty and restart the quiet-period timer.
    pub async fn schedule(self: &Arc<Self>) {
        self.pending.store(true, Ordering::SeqCst);
        let mut timer = self.timer.lock().await;
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        let this = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            // Detached so that an abort from `schedule`/`flush` can only
            // cancel the sleep, never a write in flight.
            tokio::spawn(async move {
                if let Err(e) = this.persist_pending().await {
                    tracing::warn!("Debounced save failed: {:#}", e);
                }
            });
        }));
    }

    /// Cancel the timer and write anything pending now.
    pub async fn flush(&self) -> Result<()> {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
        }
        self.persist_pending().await
    }

    /// Flush, then keep every debounced write out until the returned guard
    /// is dropped. Timers that fire meanwhile wait for the guard and then
    /// save whatever state is live at that point.
    pub async fn hold(&self) -> Result<MutexGuard<'_, ()>> {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
        }
        let saving = self.save_lock.lock().await;
        self.write_pending(&saving).await?;
        Ok(saving)
    }

    async fn persist_pending(&self) -> Result<()> {
        let saving = self.save_lock.lock().await;
        self.write_pending(&saving).await
    }

    async fn write_pending(&self, _saving: &MutexGuard<'_, ()>) -> Result<()> {
        if !self.pending.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.state.read().await;
        match self.store.save_delta(&state).await {
            Ok(count) => {
                tracing::debug!("Debounced save wrote {} command(s)", count);
                Ok(())
            }
            Err(e) => {
                self.pending.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    async fn setup(delay_ms: u64) -> (Arc<MemoryKv>, Arc<RwLock<AgentState>>, Arc<SaveDebouncer>) {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(StateStore::new(kv.clone()));
        let state = AgentState::seed("Ada");
        store.save_all(&state).await.unwrap();
        kv.clear_recorded();
        let state = Arc::new(RwLock::new(state));
        let debouncer = Arc::new(SaveDebouncer::new(
            store,
            state.clone(),
            Duration::from_millis(delay_ms),
        ));
        (kv, state, debouncer)
    }

    #[tokio::test]
    async fn rapid_schedules_coalesce_into_one_write() {
        let (kv, state, debouncer) = setup(50).await;
        for energy in [90.0, 80.0, 70.0] {
            state.write().await.meta.resources.energy = energy;
            debouncer.schedule().await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(kv.recorded_batches().len(), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test]
    async fn flush_writes_immediately_and_cancels_the_timer() {
        let (kv, state, debouncer) = setup(10_000).await;
        state.write().await.meta.resources.energy = 12.0;
        debouncer.schedule().await;

        debouncer.flush().await.unwrap();
        assert_eq!(kv.recorded_batches().len(), 1);
        debouncer.flush().await.unwrap();
        assert_eq!(kv.recorded_batches().len(), 1);
    }

    #[tokio::test]
    async fn hold_keeps_timed_saves_out_until_released() {
        let (kv, state, debouncer) = setup(10).await;
        state.write().await.meta.resources.energy = 50.0;
        debouncer.schedule().await;

        let guard = debouncer.hold().await.unwrap();
        assert_eq!(kv.recorded_batches().len(), 1);

        state.write().await.meta.resources.energy = 40.0;
        debouncer.schedule().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(kv.recorded_batches().len(), 1);
        assert!(debouncer.is_pending());

        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(kv.recorded_batches().len(), 2);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_write_pending() {
        let (kv, state, debouncer) = setup(10_000).await;
        state.write().await.meta.resources.energy = 12.0;
        debouncer.schedule().await;

        kv.set_offline(true);
        assert!(debouncer.flush().await.is_err());
        assert!(debouncer.is_pending());

        kv.set_offline(false);
        debouncer.flush().await.unwrap();
        assert!(!debouncer.is_pending());
    }
}
