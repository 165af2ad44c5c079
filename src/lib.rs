//! # sensorgate - Signal Gateways and Sensors
//!
//! A gateway turns inbound requests into normalized [`Event`]s and delivers
//! them to every sensor it targets. A sensor waits until each of its declared
//! signals has been delivered and then runs its triggers in order, persisting
//! its state machine after every transition.
//!
//! ## Core Concepts
//!
//! - **Event**: Normalized envelope of context plus opaque payload
//! - **Signal**: A named input a sensor waits for, matched by event source
//! - **Trigger**: An action run once every signal is complete
//! - **Node**: Per-signal and per-trigger status tracked in the sensor record
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sensorgate::{InMemoryVersionedStore, Reconciler, RetryPolicy, SensorRuntime};
//!
//! let store = Arc::new(InMemoryVersionedStore::new());
//! store.create(sensor)?;
//! let reconciler = Reconciler::new(store, RetryPolicy::default());
//! let runtime = SensorRuntime::start(key, reconciler, executor)?;
//! runtime.handle_notification(event)?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
pub mod event;
pub mod retry;

pub mod config;
pub mod observability;

pub mod bridge;
pub mod gateway;
pub mod sensor;
pub mod storage;

#[cfg(feature = "transport-grpc")]
pub mod transport;

pub use error::{
    DispatchError, ExecutionError, SensorError, SensorResult, TransportError, ValidationError,
};
pub use event::{ContentType, Event, EventContext};
pub use retry::RetryPolicy;

pub use config::{ConfigError, GatewayConfig, SensorConfig};
pub use observability::{init_logging, LogFormat};

pub use bridge::{RendezvousRegistry, StreamAction, StreamNotification, StreamSession};
pub use gateway::{
    DispatchReport, EventDispatcher, EventTransformer, Gateway, SensorResolver, ServiceRegistry,
};
pub use sensor::{
    CycleOutcome, DefaultTriggerExecutor, NodePhase, NotificationOutcome, Sensor, SensorKey,
    SensorRuntime, SensorSpec, Shutdown, TriggerExecutor, TriggerSpec, TriggerTemplate,
};
pub use storage::{InMemoryVersionedStore, Reconciler, StoreError, Versioned, VersionedStore};
