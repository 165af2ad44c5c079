//! Abstract versioned store for sensor records.
//!
//! The store is the single source of truth for a sensor. Every record
//! carries a version that advances on each successful write, and updates
//! are rejected when the caller's version is stale.

use thiserror::Error;

use crate::sensor::{Sensor, SensorKey};

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record not found.
    #[error("Record not found: {key}")]
    NotFound { key: String },

    /// Key already exists.
    #[error("Record already exists: {key}")]
    AlreadyExists { key: String },

    /// The stored version moved past the one the caller read.
    #[error("Version conflict on {key}: expected {expected}, stored {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Backend temporarily unreachable.
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// Backend error.
    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Conflicts and unavailability are transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Unavailable { .. })
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A value read from the store together with its version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

impl<T> Versioned<T> {
    #[must_use]
    pub const fn new(value: T, version: u64) -> Self {
        Self { value, version }
    }
}

/// Storage trait for sensor records with optimistic concurrency.
///
/// Implementations must be safe for concurrent access. Versions start at 1
/// on create and increment on every update.
pub trait VersionedStore: Send + Sync {
    /// Insert a new record. Returns the initial version.
    fn create(&self, sensor: Sensor) -> Result<u64, StoreError>;

    /// Get the current record and its version.
    fn get(&self, key: &SensorKey) -> Result<Versioned<Sensor>, StoreError>;

    /// Replace the record if the stored version equals `version`.
    ///
    /// Returns the new version, or `VersionConflict` if another writer
    /// intervened.
    fn update(&self, key: &SensorKey, sensor: Sensor, version: u64) -> Result<u64, StoreError>;

    /// Delete a record.
    fn delete(&self, key: &SensorKey) -> Result<(), StoreError>;
}
