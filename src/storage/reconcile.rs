//! Optimistic-concurrency commits of sensor status.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn};

use crate::error::{ExecutionError, SensorError, SensorResult};
use crate::retry::RetryPolicy;
use crate::sensor::{NodePhase, Sensor};
use crate::storage::traits::{StoreError, Versioned, VersionedStore};

/// Commits in-memory sensor mutations to a [`VersionedStore`].
///
/// The first attempt writes the whole in-memory record. When the store
/// reports a transient failure the reconciler backs off, re-reads the stored
/// record and re-applies only the status on top of it, so concurrent spec
/// edits are not clobbered.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn VersionedStore>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(store: Arc<dyn VersionedStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn VersionedStore> {
        &self.store
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persists `record`, updating its value and version in place on success.
    ///
    /// On exhaustion or a non-retryable store error the in-memory record is
    /// left as it was and `PersistenceFailed` is returned.
    ///
    /// If a re-read finds the stored sensor in `Error` while the local one is
    /// not, the stored record is adopted into `record`, nothing is written and
    /// `Preempted` is returned.
    pub fn commit(&self, record: &mut Versioned<Sensor>) -> SensorResult<()> {
        let key = record.value.key();
        let attempts = self.policy.attempts();

        let mut candidate = record.value.clone();
        let mut version = record.version;
        let mut last_error: Option<StoreError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                thread::sleep(self.policy.delay_for(attempt - 1));
                match self.store.get(&key) {
                    Ok(latest)
                        if latest.value.status.phase == NodePhase::Error
                            && record.value.status.phase != NodePhase::Error =>
                    {
                        warn!(sensor = %key, attempt, "stored sensor is in Error, dropping local status");
                        *record = latest;
                        return Err(ExecutionError::Preempted {
                            sensor: key.to_string(),
                        }
                        .into());
                    }
                    Ok(latest) => {
                        // Re-apply only the status onto the latest stored record.
                        let mut merged = latest.value;
                        merged.status = record.value.status.clone();
                        candidate = merged;
                        version = latest.version;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(sensor = %key, attempt, error = %e, "failed to re-read sensor before retry");
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => return Err(self.fail(&key, attempt + 1, &e)),
                }
            }

            match self.store.update(&key, candidate.clone(), version) {
                Ok(new_version) => {
                    debug!(sensor = %key, version = new_version, attempt, "sensor status persisted");
                    record.value = candidate;
                    record.version = new_version;
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!(sensor = %key, attempt, error = %e, "failed to persist sensor, retrying");
                    last_error = Some(e);
                }
                Err(e) => return Err(self.fail(&key, attempt + 1, &e)),
            }
        }

        let e = last_error.unwrap_or(StoreError::Unavailable {
            message: "retry budget exhausted".to_string(),
        });
        Err(self.fail(&key, attempts, &e))
    }

    fn fail(&self, key: &crate::sensor::SensorKey, attempts: u32, e: &StoreError) -> SensorError {
        error!(sensor = %key, attempts, error = %e, "giving up persisting sensor");
        ExecutionError::PersistenceFailed {
            sensor: key.to_string(),
            attempts,
            message: e.to_string(),
        }
        .into()
    }
}
