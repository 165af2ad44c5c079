//! Sequential trigger execution.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::SensorResult;
use crate::storage::{Reconciler, Versioned};

use super::machine::{MSG_TRIGGER_COMPLETED, MSG_TRIGGER_RUNNING};
use super::runtime::Shutdown;
use super::trigger::{TriggerContext, TriggerExecutor};
use super::types::{NodePhase, Sensor};

/// How a trigger pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every trigger succeeded.
    Completed,
    /// `trigger` failed; later triggers were not started.
    TriggerFailed { trigger: String, message: String },
    /// Shutdown was requested between two triggers, or another writer moved
    /// the sensor to `Error` before a transition could be persisted.
    Preempted,
}

/// Runs a sensor's triggers in declared order once its signals are complete.
#[derive(Clone)]
pub struct TriggerOrchestrator {
    executor: Arc<dyn TriggerExecutor>,
}

impl std::fmt::Debug for TriggerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerOrchestrator").finish_non_exhaustive()
    }
}

impl TriggerOrchestrator {
    #[must_use]
    pub fn new(executor: Arc<dyn TriggerExecutor>) -> Self {
        Self { executor }
    }

    /// Executes every trigger of `record`, persisting each transition.
    ///
    /// A failed trigger marks itself and the sensor `Error` and stops the
    /// pass. Persistence failures abort the pass with the error; the caller
    /// keeps the in-memory record for a later repair. A commit that finds the
    /// stored sensor in `Error` ends the pass as `Preempted`.
    pub fn run(
        &self,
        record: &mut Versioned<Sensor>,
        reconciler: &Reconciler,
        shutdown: &Shutdown,
    ) -> SensorResult<CycleOutcome> {
        let key = record.value.key();
        let ctx = TriggerContext {
            sensor: key.clone(),
            events: record.value.consume_events(),
        };
        let triggers = record.value.spec.triggers.clone();

        for trigger in &triggers {
            if shutdown.is_triggered() {
                warn!(sensor = %key, trigger = %trigger.name, "trigger pass preempted by shutdown");
                return Ok(CycleOutcome::Preempted);
            }

            record
                .value
                .mark_node_phase(&trigger.name, NodePhase::Active, MSG_TRIGGER_RUNNING)?;
            if !persist(record, reconciler)? {
                return Ok(CycleOutcome::Preempted);
            }

            match self.executor.execute(trigger, &ctx) {
                Ok(()) => {
                    info!(sensor = %key, trigger = %trigger.name, "trigger completed");
                    record.value.mark_node_phase(
                        &trigger.name,
                        NodePhase::Complete,
                        MSG_TRIGGER_COMPLETED,
                    )?;
                    if !persist(record, reconciler)? {
                        return Ok(CycleOutcome::Preempted);
                    }
                }
                Err(e) => {
                    error!(sensor = %key, trigger = %trigger.name, error = %e, "trigger failed");
                    record.value.fail_cycle(&trigger.name, &e.message)?;
                    if !persist(record, reconciler)? {
                        return Ok(CycleOutcome::Preempted);
                    }
                    return Ok(CycleOutcome::TriggerFailed {
                        trigger: trigger.name.clone(),
                        message: e.message,
                    });
                }
            }
        }

        record.value.complete_cycle()?;
        if !persist(record, reconciler)? {
            return Ok(CycleOutcome::Preempted);
        }
        info!(sensor = %key, repeat = record.value.spec.repeat, "trigger pass completed");
        Ok(CycleOutcome::Completed)
    }
}

/// Commits `record`; `Ok(false)` when the stored sensor preempted it.
fn persist(record: &mut Versioned<Sensor>, reconciler: &Reconciler) -> SensorResult<bool> {
    match reconciler.commit(record) {
        Ok(()) => Ok(true),
        Err(e) if e.is_preempted() => {
            warn!(sensor = %record.value.key(), "trigger pass preempted by stored Error");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
