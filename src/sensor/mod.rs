//! Sensor aggregate, its state machine and the trigger path.
//!
//! A sensor declares signals it waits for and triggers it runs once every
//! signal has been delivered. [`SensorRuntime`] owns the in-memory record
//! and is the only writer for one sensor instance.

mod machine;
mod orchestrator;
mod runtime;
mod trigger;
mod types;

pub use machine::{
    MSG_SENSOR_COMPLETED, MSG_SIGNAL_COMPLETED, MSG_STREAM_ESTABLISHED, MSG_TRIGGER_COMPLETED,
    MSG_TRIGGER_RUNNING,
};
pub use orchestrator::{CycleOutcome, TriggerOrchestrator};
pub use runtime::{
    NotificationOutcome, SensorRuntime, Shutdown, WatchHandle, DEFAULT_WATCH_INTERVAL,
};
pub use trigger::{
    DefaultTriggerExecutor, TriggerContext, TriggerError, TriggerExecutor, TriggerSpec,
    TriggerTemplate,
};
pub use types::{
    validate_name, EventRecord, NodeId, NodeKind, NodePhase, NodeStatus, Sensor, SensorKey,
    SensorSpec, SensorStatus, SignalSpec, MAX_NAME_LEN,
};
