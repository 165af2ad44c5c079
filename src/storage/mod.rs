//! Versioned persistence for sensor records.
//!
//! The [`VersionedStore`] trait is the boundary to the external system of
//! record. [`Reconciler`] layers the conflict-retry protocol on top of it.

mod memory;
mod reconcile;
mod traits;

pub use memory::InMemoryVersionedStore;
pub use reconcile::Reconciler;
pub use traits::{StoreError, Versioned, VersionedStore};
