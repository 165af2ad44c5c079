//! Per-node state machine.
//!
//! ```text
//! New -> Active -> Complete
//!          |          |
//!          v          +--> Active   (repeating sensors)
//!        Error        (trigger nodes only)
//! ```
//!
//! Signal nodes may skip `Active` and go straight from `New` to `Complete`
//! on the first push delivery.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, error};

use crate::error::{SensorError, SensorResult, ValidationError};
use crate::event::Event;

use super::types::{EventRecord, NodeKind, NodePhase, NodeStatus, Sensor};

pub const MSG_STREAM_ESTABLISHED: &str = "stream established";
pub const MSG_SIGNAL_COMPLETED: &str = "signal processing completed";
pub const MSG_SIGNAL_RESET: &str = "signal reset for next cycle";
pub const MSG_TRIGGER_RUNNING: &str = "trigger is about to run";
pub const MSG_TRIGGER_COMPLETED: &str = "trigger completed successfully";
pub const MSG_SENSOR_ACTIVE: &str = "sensor is active";
pub const MSG_SENSOR_COMPLETED: &str = "sensor completed";

fn transition_allowed(kind: NodeKind, from: NodePhase, to: NodePhase) -> bool {
    use NodePhase::{Active, Complete, Error, New};

    match (from, to) {
        (New | Active | Complete, Active) | (Active, Complete) => true,
        (New, Complete) => kind == NodeKind::Signal,
        (Active, Error) => kind == NodeKind::Trigger,
        _ => false,
    }
}

fn invariant(sensor: &Sensor, reason: String) -> SensorError {
    error!(sensor = %sensor.key(), reason = %reason, "invariant violation");
    SensorError::invariant(reason)
}

fn enter_phase(
    phase: &mut NodePhase,
    started_at: &mut Option<chrono::DateTime<Utc>>,
    completed_at: &mut Option<chrono::DateTime<Utc>>,
    to: NodePhase,
) {
    let now = Utc::now();
    *phase = to;
    if to == NodePhase::Active && started_at.is_none() {
        *started_at = Some(now);
    }
    if to.is_terminal() && completed_at.is_none() {
        *completed_at = Some(now);
    }
}

impl Sensor {
    /// Creates a `New` node for every declared signal and trigger that has
    /// none yet, and moves a `New` sensor to `Active`.
    ///
    /// Returns true if anything changed.
    pub fn initialize(&mut self) -> bool {
        let mut changed = false;

        let declared: Vec<(String, NodeKind)> = self
            .spec
            .signals
            .iter()
            .map(|s| (s.name.clone(), NodeKind::Signal))
            .chain(
                self.spec
                    .triggers
                    .iter()
                    .map(|t| (t.name.clone(), NodeKind::Trigger)),
            )
            .collect();

        for (name, kind) in declared {
            let id = self.node_id(&name);
            if !self.status.nodes.contains_key(&id) {
                debug!(sensor = %self.key(), node = %name, %kind, "initializing node");
                self.status
                    .nodes
                    .insert(id.clone(), NodeStatus::new(id, name, kind));
                changed = true;
            }
        }

        if self.status.phase == NodePhase::New {
            let status = &mut self.status;
            enter_phase(
                &mut status.phase,
                &mut status.started_at,
                &mut status.completed_at,
                NodePhase::Active,
            );
            status.message = MSG_SENSOR_ACTIVE.to_string();
            changed = true;
        }

        changed
    }

    /// Moves node `name` to `phase`.
    ///
    /// Fails with `InvariantViolation` if the node does not exist or the
    /// transition is not part of the state machine.
    pub fn mark_node_phase(
        &mut self,
        name: &str,
        phase: NodePhase,
        message: impl Into<String>,
    ) -> SensorResult<()> {
        let Some(node) = self.node(name) else {
            return Err(invariant(self, format!("node '{name}' is uninitialized")));
        };
        let (kind, from) = (node.kind, node.phase);
        if !transition_allowed(kind, from, phase) {
            return Err(invariant(
                self,
                format!("illegal {kind} transition for '{name}': {from} -> {phase}"),
            ));
        }

        let key = self.key();
        let Some(node) = self.node_mut(name) else {
            return Err(SensorError::invariant(format!("node '{name}' is uninitialized")));
        };
        enter_phase(
            &mut node.phase,
            &mut node.started_at,
            &mut node.completed_at,
            phase,
        );
        node.message = message.into();
        debug!(sensor = %key, node = %name, %from, to = %phase, "node phase changed");
        Ok(())
    }

    /// Moves the sensor itself to `phase`.
    pub fn mark_phase(&mut self, phase: NodePhase, message: impl Into<String>) -> SensorResult<()> {
        let from = self.status.phase;
        let allowed = matches!(
            (from, phase),
            (NodePhase::New, NodePhase::Active | NodePhase::Error)
                | (NodePhase::Active, NodePhase::Complete | NodePhase::Error)
        );
        if !allowed {
            return Err(invariant(
                self,
                format!("illegal sensor transition: {from} -> {phase}"),
            ));
        }
        let status = &mut self.status;
        enter_phase(
            &mut status.phase,
            &mut status.started_at,
            &mut status.completed_at,
            phase,
        );
        status.message = message.into();
        Ok(())
    }

    /// Records that a live stream is attached for `signal`.
    ///
    /// Returns true if the node moved from `New` to `Active`.
    pub fn stream_established(&mut self, signal: &str) -> SensorResult<bool> {
        match self.node(signal).map(|n| n.phase) {
            Some(NodePhase::New) => {
                self.mark_node_phase(signal, NodePhase::Active, MSG_STREAM_ESTABLISHED)?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(invariant(self, format!("node '{signal}' is uninitialized"))),
        }
    }

    /// Checks that `event` may complete one of this sensor's signals.
    ///
    /// Validation failures are returned as `SensorError::Validation`.
    pub fn accept_notification(&self, event: &Event) -> SensorResult<()> {
        let signal = event.source();
        if !self.spec.declares_signal(signal) {
            return Err(ValidationError::UnknownSignalSource {
                signal: signal.to_string(),
            }
            .into());
        }
        let Some(node) = self.node(signal) else {
            return Err(invariant(self, format!("node '{signal}' is uninitialized")));
        };
        if node.phase == NodePhase::Complete {
            return Err(ValidationError::SignalAlreadyComplete {
                signal: signal.to_string(),
            }
            .into());
        }
        if self.status.phase != NodePhase::Active {
            return Err(ValidationError::SensorNotAccepting {
                phase: self.status.phase,
            }
            .into());
        }
        Ok(())
    }

    /// Attaches `event` to its signal node and completes the node.
    pub fn process_signal(&mut self, event: Event) -> SensorResult<()> {
        let signal = event.source().to_string();
        self.mark_node_phase(&signal, NodePhase::Complete, MSG_SIGNAL_COMPLETED)?;
        if let Some(node) = self.node_mut(&signal) {
            node.latest_event = Some(EventRecord { event, seen: false });
        }
        Ok(())
    }

    /// True when every declared signal is `Complete` and the sensor is `Active`.
    #[must_use]
    pub fn ready_to_fire(&self) -> bool {
        self.status.phase == NodePhase::Active
            && self
                .spec
                .signals
                .iter()
                .all(|s| self.node(&s.name).is_some_and(|n| n.phase == NodePhase::Complete))
    }

    /// Returns the latest event of every signal and marks them seen.
    pub fn consume_events(&mut self) -> BTreeMap<String, Event> {
        let mut events = BTreeMap::new();
        for node in self.status.nodes.values_mut() {
            if node.kind != NodeKind::Signal {
                continue;
            }
            if let Some(record) = node.latest_event.as_mut() {
                record.seen = true;
                events.insert(node.name.clone(), record.event.clone());
            }
        }
        events
    }

    /// Closes a successful trigger pass.
    ///
    /// Repeating sensors re-arm their signals; one-shot sensors complete.
    pub fn complete_cycle(&mut self) -> SensorResult<()> {
        if self.spec.repeat {
            let signals: Vec<String> = self.spec.signals.iter().map(|s| s.name.clone()).collect();
            for signal in signals {
                self.mark_node_phase(&signal, NodePhase::Active, MSG_SIGNAL_RESET)?;
            }
            Ok(())
        } else {
            self.mark_phase(NodePhase::Complete, MSG_SENSOR_COMPLETED)
        }
    }

    /// Marks trigger `name` and the sensor as failed.
    pub fn fail_cycle(&mut self, trigger: &str, message: &str) -> SensorResult<()> {
        self.mark_node_phase(trigger, NodePhase::Error, message)?;
        self.mark_phase(
            NodePhase::Error,
            format!("trigger '{trigger}' failed: {message}"),
        )
    }
}
