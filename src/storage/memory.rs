//! In-memory storage backend.
//!
//! Thread-safe implementation of [`VersionedStore`]. It is intended for
//! embedded usage, tests, and as a reference implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::sensor::{Sensor, SensorKey};
use crate::storage::traits::{StoreError, Versioned, VersionedStore};

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Backend {
        message: format!("poisoned lock: {context}"),
    }
}

/// In-memory versioned store.
#[derive(Debug, Default)]
pub struct InMemoryVersionedStore {
    records: RwLock<HashMap<SensorKey, Versioned<Sensor>>>,
}

impl InMemoryVersionedStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize, StoreError> {
        let records = self.records.read().map_err(|_| lock_err("len"))?;
        Ok(records.len())
    }

    /// True when the store holds no records.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Applies `mutate` to the stored record and bumps its version.
    ///
    /// Simulates a foreign writer (an operator or another controller).
    pub fn modify<F>(&self, key: &SensorKey, mutate: F) -> Result<u64, StoreError>
    where
        F: FnOnce(&mut Sensor),
    {
        let mut records = self.records.write().map_err(|_| lock_err("modify"))?;
        let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        mutate(&mut record.value);
        record.version += 1;
        Ok(record.version)
    }
}

impl VersionedStore for InMemoryVersionedStore {
    fn create(&self, sensor: Sensor) -> Result<u64, StoreError> {
        let key = sensor.key();
        let mut records = self.records.write().map_err(|_| lock_err("create"))?;
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                key: key.to_string(),
            });
        }
        records.insert(key, Versioned::new(sensor, 1));
        Ok(1)
    }

    fn get(&self, key: &SensorKey) -> Result<Versioned<Sensor>, StoreError> {
        let records = self.records.read().map_err(|_| lock_err("get"))?;
        records.get(key).cloned().ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }

    fn update(&self, key: &SensorKey, sensor: Sensor, version: u64) -> Result<u64, StoreError> {
        let mut records = self.records.write().map_err(|_| lock_err("update"))?;
        let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        if record.version != version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: version,
                actual: record.version,
            });
        }
        record.value = sensor;
        record.version += 1;
        Ok(record.version)
    }

    fn delete(&self, key: &SensorKey) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| lock_err("delete"))?;
        records
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{SensorSpec, SignalSpec, TriggerSpec, TriggerTemplate};

    fn sensor(name: &str) -> Sensor {
        Sensor::new(
            name,
            "default",
            SensorSpec {
                signals: vec![SignalSpec::new("s1")],
                triggers: vec![TriggerSpec::new("t1", TriggerTemplate::Log { message: None })],
                repeat: false,
            },
        )
    }

    #[test]
    fn create_get_update_delete() {
        let store = InMemoryVersionedStore::new();
        let s = sensor("a");
        let key = s.key();
        assert_eq!(store.create(s.clone()).unwrap(), 1);
        assert!(matches!(
            store.create(s).unwrap_err(),
            StoreError::AlreadyExists { .. }
        ));

        let mut current = store.get(&key).unwrap();
        assert_eq!(current.version, 1);
        current.value.status.message = "updated".to_string();
        let v = store.update(&key, current.value.clone(), 1).unwrap();
        assert_eq!(v, 2);
        assert_eq!(store.get(&key).unwrap().value.status.message, "updated");

        store.delete(&key).unwrap();
        assert!(store.get(&key).unwrap_err().is_not_found());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn stale_update_conflicts() {
        let store = InMemoryVersionedStore::new();
        let s = sensor("a");
        let key = s.key();
        store.create(s.clone()).unwrap();
        store.modify(&key, |s| s.spec.repeat = true).unwrap();

        let err = store.update(&key, s, 1).unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                key: "default/a".to_string(),
                expected: 1,
                actual: 2,
            }
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn update_missing_record() {
        let store = InMemoryVersionedStore::new();
        let s = sensor("missing");
        let err = store.update(&s.key(), s, 1).unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }
}
