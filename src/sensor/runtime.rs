//! Single-owner runtime for one sensor instance.
//!
//! Every mutation of the in-memory record happens under one mutex, so
//! notifications for the same sensor are handled to completion in arrival
//! order. Readers get cloned snapshots.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{SensorError, SensorResult, ValidationError};
use crate::event::Event;
use crate::storage::{Reconciler, Versioned};

use super::orchestrator::{CycleOutcome, TriggerOrchestrator};
use super::trigger::TriggerExecutor;
use super::types::{NodePhase, Sensor, SensorKey};

/// Default interval between watch passes.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide shutdown flag shared by the listening surfaces.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once shutdown was requested.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on `true`.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Result of handing one notification to the sensor.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
    /// Rejected by validation; no state changed.
    Dropped(ValidationError),
    /// The signal completed; other signals are still pending.
    Recorded,
    /// The signal completed the set and a trigger pass ran.
    Fired(CycleOutcome),
    /// Another writer moved the sensor to `Error`; the stored record was
    /// adopted and the sensor shut down.
    Preempted,
}

#[derive(Debug)]
struct RuntimeState {
    record: Versioned<Sensor>,
    /// The last commit failed; in-memory state is ahead of the store.
    dirty: bool,
}

/// Owns the in-memory copy of one sensor and serializes its mutations.
#[derive(Debug)]
pub struct SensorRuntime {
    key: SensorKey,
    reconciler: Reconciler,
    orchestrator: TriggerOrchestrator,
    state: Mutex<RuntimeState>,
    shutdown: Shutdown,
}

impl SensorRuntime {
    /// Loads, validates and initializes the sensor stored under `key`.
    pub fn start(
        key: SensorKey,
        reconciler: Reconciler,
        executor: Arc<dyn TriggerExecutor>,
    ) -> SensorResult<Self> {
        let mut record = reconciler.store().get(&key)?;
        record.value.spec.validate()?;
        if record.value.initialize() {
            reconciler.commit(&mut record)?;
        }

        let shutdown = Shutdown::new();
        if record.value.status.phase == NodePhase::Error {
            warn!(sensor = %key, "sensor is in error phase, not accepting notifications");
            shutdown.trigger();
        }
        info!(sensor = %key, version = record.version, phase = %record.value.status.phase, "sensor started");

        Ok(Self {
            key,
            reconciler,
            orchestrator: TriggerOrchestrator::new(executor),
            state: Mutex::new(RuntimeState {
                record,
                dirty: false,
            }),
            shutdown,
        })
    }

    #[must_use]
    pub const fn key(&self) -> &SensorKey {
        &self.key
    }

    #[must_use]
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    fn lock(&self) -> SensorResult<MutexGuard<'_, RuntimeState>> {
        self.state
            .lock()
            .map_err(|_| SensorError::invariant(format!("sensor state lock poisoned: {}", self.key)))
    }

    /// A copy of the current in-memory record.
    pub fn snapshot(&self) -> SensorResult<Sensor> {
        Ok(self.lock()?.record.value.clone())
    }

    /// The sensor accepts notifications while `Active` and not shut down.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        if self.shutdown.is_triggered() {
            return false;
        }
        self.lock()
            .map(|s| s.record.value.status.phase == NodePhase::Active)
            .unwrap_or(false)
    }

    /// Validates `event`, completes its signal and runs the triggers when
    /// every signal is complete.
    ///
    /// Blocks for the duration of the trigger pass.
    pub fn handle_notification(&self, event: Event) -> SensorResult<NotificationOutcome> {
        let mut state = self.lock()?;

        match state.record.value.accept_notification(&event) {
            Ok(()) => {}
            Err(SensorError::Validation(e)) => {
                match &e {
                    ValidationError::SignalAlreadyComplete { .. } => {
                        debug!(sensor = %self.key, signal = %event.source(), event_id = %event.id(), "duplicate notification dropped");
                    }
                    _ => {
                        warn!(sensor = %self.key, signal = %event.source(), error = %e, "notification rejected");
                    }
                }
                return Ok(NotificationOutcome::Dropped(e));
            }
            Err(e) => return Err(e),
        }

        let signal = event.source().to_string();
        let event_id = event.id().to_string();
        state.record.value.process_signal(event)?;
        info!(sensor = %self.key, %signal, %event_id, "signal completed");

        match self.reconciler.commit(&mut state.record) {
            Ok(()) => {}
            Err(e) if e.is_preempted() => {
                self.preempted();
                return Ok(NotificationOutcome::Preempted);
            }
            Err(e) => {
                state.dirty = true;
                return Err(e);
            }
        }

        if !state.record.value.ready_to_fire() {
            return Ok(NotificationOutcome::Recorded);
        }
        self.fire(&mut state).map(NotificationOutcome::Fired)
    }

    fn fire(&self, state: &mut RuntimeState) -> SensorResult<CycleOutcome> {
        info!(sensor = %self.key, "all signals complete, running triggers");
        let outcome = self
            .orchestrator
            .run(&mut state.record, &self.reconciler, &self.shutdown)
            .inspect_err(|_| state.dirty = true)?;
        if state.record.value.status.phase == NodePhase::Error {
            self.shutdown.trigger();
        }
        Ok(outcome)
    }

    fn preempted(&self) {
        warn!(sensor = %self.key, "stored sensor moved to error phase, shutting down");
        self.shutdown.trigger();
    }

    /// Marks `signal` as having a live stream attached.
    pub fn stream_established(&self, signal: &str) -> SensorResult<()> {
        let mut state = self.lock()?;
        if !state.record.value.spec.declares_signal(signal) {
            return Err(ValidationError::UnknownSignalSource {
                signal: signal.to_string(),
            }
            .into());
        }
        if state.record.value.stream_established(signal)? {
            if let Err(e) = self.reconciler.commit(&mut state.record) {
                if e.is_preempted() {
                    self.preempted();
                } else {
                    state.dirty = true;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// One watch pass against the stored record.
    ///
    /// Shuts the listening surfaces down if the stored phase became `Error`,
    /// re-commits a dirty local copy, and otherwise adopts newer stored
    /// versions. A stored `Error` always wins over local state.
    pub fn reconcile(&self) -> SensorResult<()> {
        let stored = self.reconciler.store().get(&self.key)?;
        let stored_error = stored.value.status.phase == NodePhase::Error;

        // Checked before locking so a running trigger pass sees it.
        if stored_error && !self.shutdown.is_triggered() {
            self.preempted();
        }

        let mut state = self.lock()?;
        if stored_error && state.record.value.status.phase != NodePhase::Error {
            if state.dirty {
                warn!(sensor = %self.key, "discarding unpersisted status of errored sensor");
            }
            state.record = stored;
            state.dirty = false;
            return Ok(());
        }

        if state.dirty {
            info!(sensor = %self.key, "repairing sensor status");
            if let Err(e) = self.reconciler.commit(&mut state.record) {
                if e.is_preempted() {
                    state.dirty = false;
                    self.preempted();
                }
                return Err(e);
            }
            state.dirty = false;
            if state.record.value.ready_to_fire() && !self.shutdown.is_triggered() {
                self.fire(&mut state)?;
            }
            return Ok(());
        }

        if stored.version > state.record.version {
            if let Err(e) = stored.value.spec.validate() {
                warn!(sensor = %self.key, version = stored.version, error = %e, "stored sensor spec is invalid, keeping current version");
                return Err(e.into());
            }
            debug!(sensor = %self.key, from = state.record.version, to = stored.version, "adopting stored sensor");
            state.record = stored;
            if state.record.value.initialize() {
                if let Err(e) = self.reconciler.commit(&mut state.record) {
                    if e.is_preempted() {
                        self.preempted();
                    } else {
                        state.dirty = true;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Spawns the watch thread. Dropping the handle stops it.
    pub fn spawn_watch(self: &Arc<Self>, interval: Duration) -> std::io::Result<WatchHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let runtime = Arc::clone(self);
        let join = thread::Builder::new()
            .name(format!("sensor-watch-{}", self.key.name))
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(e) = runtime.reconcile() {
                                warn!(sensor = %runtime.key, error = %e, "watch pass failed");
                            }
                        }
                    }
                }
                debug!(sensor = %runtime.key, "watch thread stopped");
            })?;
        Ok(WatchHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

/// Handle to a running watch thread.
#[derive(Debug)]
pub struct WatchHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stops the watch thread and waits for it to exit.
    pub fn stop(mut self) {
        self.stop.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        // Disconnecting the channel ends the loop; the thread is detached.
        self.stop.take();
        self.join.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::event::EventContext;
    use crate::retry::RetryPolicy;
    use crate::sensor::{
        SensorSpec, SignalSpec, TriggerContext, TriggerError, TriggerSpec, TriggerTemplate,
    };
    use crate::storage::{InMemoryVersionedStore, StoreError, VersionedStore};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl TriggerExecutor for Counter {
        fn execute(&self, _: &TriggerSpec, _: &TriggerContext) -> Result<(), TriggerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(source: &str) -> Event {
        Event::new(
            EventContext::new(source, "com.example", "v1", "application/json"),
            b"{}".to_vec(),
        )
    }

    fn start(
        signals: &[&str],
        repeat: bool,
    ) -> (Arc<InMemoryVersionedStore>, SensorRuntime, Arc<Counter>) {
        let sensor = Sensor::new(
            "build",
            "ci",
            SensorSpec {
                signals: signals.iter().map(|s| SignalSpec::new(*s)).collect(),
                triggers: vec![TriggerSpec::new("t1", TriggerTemplate::Log { message: None })],
                repeat,
            },
        );
        let key = sensor.key();
        let store = Arc::new(InMemoryVersionedStore::new());
        store.create(sensor).unwrap();
        let counter = Arc::new(Counter::default());
        let runtime = SensorRuntime::start(
            key,
            Reconciler::new(store.clone(), RetryPolicy::immediate(3)),
            counter.clone(),
        )
        .unwrap();
        (store, runtime, counter)
    }

    #[test]
    fn start_initializes_and_persists() {
        let (store, runtime, _) = start(&["s1", "s2"], false);
        let stored = store.get(runtime.key()).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.value.status.phase, NodePhase::Active);
        assert_eq!(stored.value.status.nodes.len(), 3);
        assert!(runtime.is_accepting());
    }

    #[test]
    fn start_rejects_invalid_spec() {
        let store = Arc::new(InMemoryVersionedStore::new());
        let sensor = Sensor::new(
            "empty",
            "ci",
            SensorSpec {
                signals: Vec::new(),
                triggers: Vec::new(),
                repeat: false,
            },
        );
        let key = sensor.key();
        store.create(sensor).unwrap();
        let err = SensorRuntime::start(
            key,
            Reconciler::new(store, RetryPolicy::immediate(1)),
            Arc::new(Counter::default()),
        )
        .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn two_signal_scenario() {
        let (store, runtime, counter) = start(&["s1", "s2"], false);

        assert_eq!(
            runtime.handle_notification(event("s1")).unwrap(),
            NotificationOutcome::Recorded
        );
        let snap = runtime.snapshot().unwrap();
        assert_eq!(snap.node("s1").unwrap().phase, NodePhase::Complete);
        assert_eq!(snap.status.phase, NodePhase::Active);

        assert_eq!(
            runtime.handle_notification(event("s2")).unwrap(),
            NotificationOutcome::Fired(CycleOutcome::Completed)
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get(runtime.key()).unwrap().value.status.phase,
            NodePhase::Complete
        );

        let before = runtime.snapshot().unwrap();
        let outcome = runtime.handle_notification(event("s1")).unwrap();
        assert!(matches!(
            outcome,
            NotificationOutcome::Dropped(ValidationError::SignalAlreadyComplete { .. })
        ));
        assert_eq!(runtime.snapshot().unwrap(), before);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeating_sensor_fires_every_cycle() {
        let (_store, runtime, counter) = start(&["s1"], true);
        for _ in 0..3 {
            assert_eq!(
                runtime.handle_notification(event("s1")).unwrap(),
                NotificationOutcome::Fired(CycleOutcome::Completed)
            );
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
        assert!(runtime.is_accepting());
    }

    #[test]
    fn external_error_shuts_down() {
        let (store, runtime, _) = start(&["s1"], false);
        store
            .modify(runtime.key(), |s| s.status.phase = NodePhase::Error)
            .unwrap();

        runtime.reconcile().unwrap();
        assert!(runtime.shutdown_signal().is_triggered());
        assert!(!runtime.is_accepting());
        let outcome = runtime.handle_notification(event("s1")).unwrap();
        assert!(matches!(
            outcome,
            NotificationOutcome::Dropped(ValidationError::SensorNotAccepting { .. })
        ));
    }

    #[test]
    fn reconcile_adopts_new_signals() {
        let (store, runtime, _) = start(&["s1"], false);
        store
            .modify(runtime.key(), |s| s.spec.signals.push(SignalSpec::new("s2")))
            .unwrap();

        runtime.reconcile().unwrap();
        let snap = runtime.snapshot().unwrap();
        assert_eq!(snap.node("s2").unwrap().phase, NodePhase::New);
        assert!(store.get(runtime.key()).unwrap().value.node("s2").is_some());
    }

    #[test]
    fn watch_thread_observes_error() {
        let (store, runtime, _) = start(&["s1"], false);
        let runtime = Arc::new(runtime);
        let watch = runtime.spawn_watch(Duration::from_millis(10)).unwrap();
        store
            .modify(runtime.key(), |s| s.status.phase = NodePhase::Error)
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !runtime.shutdown_signal().is_triggered() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(runtime.shutdown_signal().is_triggered());
        watch.stop();
    }

    /// Rejects every update as unavailable while `failing` is set.
    #[derive(Default)]
    struct OutageStore {
        inner: InMemoryVersionedStore,
        failing: AtomicBool,
    }

    impl VersionedStore for OutageStore {
        fn create(&self, sensor: Sensor) -> Result<u64, StoreError> {
            self.inner.create(sensor)
        }
        fn get(&self, key: &SensorKey) -> Result<Versioned<Sensor>, StoreError> {
            self.inner.get(key)
        }
        fn update(&self, key: &SensorKey, sensor: Sensor, version: u64) -> Result<u64, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable {
                    message: "store is down".to_string(),
                });
            }
            self.inner.update(key, sensor, version)
        }
        fn delete(&self, key: &SensorKey) -> Result<(), StoreError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn reconcile_repairs_and_fires_after_outage() {
        let store = Arc::new(OutageStore::default());
        let sensor = Sensor::new(
            "build",
            "ci",
            SensorSpec {
                signals: vec![SignalSpec::new("s1")],
                triggers: vec![TriggerSpec::new("t1", TriggerTemplate::Log { message: None })],
                repeat: false,
            },
        );
        let key = sensor.key();
        store.create(sensor).unwrap();
        let counter = Arc::new(Counter::default());
        let runtime = SensorRuntime::start(
            key.clone(),
            Reconciler::new(store.clone(), RetryPolicy::immediate(3)),
            counter.clone(),
        )
        .unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let err = runtime.handle_notification(event("s1")).unwrap_err();
        assert!(matches!(
            err,
            SensorError::Execution(crate::error::ExecutionError::PersistenceFailed { attempts: 3, .. })
        ));
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.snapshot().unwrap().node("s1").unwrap().phase, NodePhase::Complete);
        assert_eq!(store.get(&key).unwrap().value.node("s1").unwrap().phase, NodePhase::New);

        // Still down: the repair fails and stays pending.
        assert!(runtime.reconcile().is_err());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        store.failing.store(false, Ordering::SeqCst);
        runtime.reconcile().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        let stored = store.get(&key).unwrap().value;
        assert_eq!(stored.node("s1").unwrap().phase, NodePhase::Complete);
        assert_eq!(stored.status.phase, NodePhase::Complete);

        // Nothing left to repair.
        runtime.reconcile().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stored_error_preempts_notification() {
        let (store, runtime, counter) = start(&["s1"], false);
        store
            .modify(runtime.key(), |s| s.status.phase = NodePhase::Error)
            .unwrap();

        let outcome = runtime.handle_notification(event("s1")).unwrap();
        assert_eq!(outcome, NotificationOutcome::Preempted);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert!(runtime.shutdown_signal().is_triggered());
        assert_eq!(runtime.snapshot().unwrap().status.phase, NodePhase::Error);

        let stored = store.get(runtime.key()).unwrap().value;
        assert_eq!(stored.status.phase, NodePhase::Error);
        assert_eq!(stored.node("s1").unwrap().phase, NodePhase::New);
    }

    #[test]
    fn stored_error_discards_pending_repair() {
        let store = Arc::new(OutageStore::default());
        let sensor = Sensor::new(
            "build",
            "ci",
            SensorSpec {
                signals: vec![SignalSpec::new("s1")],
                triggers: vec![TriggerSpec::new("t1", TriggerTemplate::Log { message: None })],
                repeat: false,
            },
        );
        let key = sensor.key();
        store.create(sensor).unwrap();
        let counter = Arc::new(Counter::default());
        let runtime = SensorRuntime::start(
            key.clone(),
            Reconciler::new(store.clone(), RetryPolicy::immediate(2)),
            counter.clone(),
        )
        .unwrap();

        store.failing.store(true, Ordering::SeqCst);
        assert!(runtime.handle_notification(event("s1")).is_err());
        store.inner.modify(&key, |s| s.status.phase = NodePhase::Error).unwrap();
        store.failing.store(false, Ordering::SeqCst);

        runtime.reconcile().unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert!(runtime.shutdown_signal().is_triggered());
        let snap = runtime.snapshot().unwrap();
        assert_eq!(snap.status.phase, NodePhase::Error);
        assert_eq!(snap.node("s1").unwrap().phase, NodePhase::New);
        assert_eq!(store.get(&key).unwrap().value.status.phase, NodePhase::Error);
    }

    #[test]
    fn reconcile_refuses_invalid_stored_spec() {
        let (store, runtime, _) = start(&["s1"], false);
        let before = runtime.snapshot().unwrap();
        store
            .modify(runtime.key(), |s| s.spec.signals.push(SignalSpec::new("s1")))
            .unwrap();

        let err = runtime.reconcile().unwrap_err();
        assert!(err.is_validation());
        assert_eq!(runtime.snapshot().unwrap(), before);
        assert!(runtime.is_accepting());
    }
}
