//! Rendezvous registry for the stream transport.
//!
//! Each `(sensor, signal)` pair owns one unbuffered slot. A delivery blocks
//! until the stream session listening on that slot takes the notification,
//! then waits for the session's action reply. Slots are created when a
//! session first listens and live as long as the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, SensorError, SensorResult};
use crate::event::{Event, EventContext, MEDIA_TYPE_JSON};
use crate::sensor::SensorKey;

/// Default time a delivery waits for a listening session to take it.
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Slot key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    pub sensor: SensorKey,
    pub signal: String,
}

impl RendezvousKey {
    #[must_use]
    pub fn new(sensor: SensorKey, signal: impl Into<String>) -> Self {
        Self {
            sensor,
            signal: signal.into(),
        }
    }
}

impl fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sensor, self.signal)
    }
}

/// What the delivering side should do after a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAction {
    /// Keep the stream open for the next notification.
    ContinueAndRepeat,
    /// Close the stream.
    ContinueAndStop,
}

/// A notification delivered through the stream transport.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamNotification {
    /// Signal name.
    pub name: String,
    pub event_type: String,
    /// Full event, when the deliverer has one.
    pub event: Option<Event>,
}

impl StreamNotification {
    #[must_use]
    pub fn new(name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            event: None,
        }
    }

    /// The carried event, or a payload-less event sourced from `name`.
    #[must_use]
    pub fn into_event(self) -> Event {
        match self.event {
            Some(event) => event,
            None => Event::new(
                EventContext::new(self.name, self.event_type, "", MEDIA_TYPE_JSON),
                Vec::new(),
            ),
        }
    }
}

/// One pending delivery waiting for the session's action.
#[derive(Debug)]
pub struct Handoff {
    pub notification: StreamNotification,
    pub reply: Sender<SensorResult<StreamAction>>,
}

#[derive(Debug)]
struct Slot {
    tx: Sender<Handoff>,
    rx: Receiver<Handoff>,
    listening: AtomicBool,
}

/// Exclusive right to receive on one slot.
///
/// Dropping the listener releases the slot for the next session.
#[derive(Debug)]
pub struct Listener {
    key: RendezvousKey,
    slot: Arc<Slot>,
    released: bool,
}

impl Listener {
    #[must_use]
    pub const fn key(&self) -> &RendezvousKey {
        &self.key
    }

    #[must_use]
    pub fn receiver(&self) -> &Receiver<Handoff> {
        &self.slot.rx
    }

    /// Releases the slot ahead of drop so a new session can claim it.
    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.slot.listening.store(false, Ordering::Release);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-process registry of rendezvous slots.
#[derive(Debug)]
pub struct RendezvousRegistry {
    slots: Mutex<HashMap<RendezvousKey, Arc<Slot>>>,
    handoff_timeout: Duration,
}

impl Default for RendezvousRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HANDOFF_TIMEOUT)
    }
}

impl RendezvousRegistry {
    #[must_use]
    pub fn new(handoff_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            handoff_timeout,
        }
    }

    fn lock_err() -> SensorError {
        SensorError::invariant("rendezvous registry lock poisoned")
    }

    /// Claims the slot for `key`, creating it on first use.
    ///
    /// Fails with `StreamAlreadyOpen` if another session listens already.
    pub fn listen(&self, key: RendezvousKey) -> SensorResult<Listener> {
        let slot = {
            let mut slots = self.slots.lock().map_err(|_| Self::lock_err())?;
            Arc::clone(slots.entry(key.clone()).or_insert_with(|| {
                let (tx, rx) = bounded(0);
                Arc::new(Slot {
                    tx,
                    rx,
                    listening: AtomicBool::new(false),
                })
            }))
        };

        if slot.listening.swap(true, Ordering::AcqRel) {
            return Err(ExecutionError::StreamAlreadyOpen {
                key: key.to_string(),
            }
            .into());
        }
        Ok(Listener {
            key,
            slot,
            released: false,
        })
    }

    /// True if a session currently listens on `key`.
    #[must_use]
    pub fn is_listening(&self, key: &RendezvousKey) -> bool {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(key).map(|s| s.listening.load(Ordering::Acquire)))
            .unwrap_or(false)
    }

    /// Number of slots ever created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands `notification` to the session listening on `key` and waits for
    /// its action.
    ///
    /// Blocks until a session takes the notification (bounded by the handoff
    /// timeout) and then until it replies.
    pub fn deliver(
        &self,
        key: &RendezvousKey,
        notification: StreamNotification,
    ) -> SensorResult<StreamAction> {
        let slot = {
            let slots = self.slots.lock().map_err(|_| Self::lock_err())?;
            slots.get(key).cloned()
        };
        let Some(slot) = slot.filter(|s| s.listening.load(Ordering::Acquire)) else {
            return Err(ExecutionError::NoActiveStream {
                key: key.to_string(),
            }
            .into());
        };

        let (reply_tx, reply_rx) = bounded(1);
        let handoff = Handoff {
            notification,
            reply: reply_tx,
        };
        slot.tx
            .send_timeout(handoff, self.handoff_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ExecutionError::Timeout {
                    duration_ms: u64::try_from(self.handoff_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                },
                SendTimeoutError::Disconnected(_) => ExecutionError::Disconnected {
                    path: key.to_string(),
                },
            })?;

        reply_rx.recv().map_err(|_| {
            SensorError::from(ExecutionError::Disconnected {
                path: key.to_string(),
            })
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(signal: &str) -> RendezvousKey {
        RendezvousKey::new(SensorKey::new("ci", "build"), signal)
    }

    #[test]
    fn delivery_without_listener_fails() {
        let registry = RendezvousRegistry::default();
        let err = registry
            .deliver(&key("s1"), StreamNotification::new("s1", "push"))
            .unwrap_err();
        assert!(matches!(
            err,
            SensorError::Execution(ExecutionError::NoActiveStream { .. })
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn handoff_pairs_notification_with_action() {
        let registry = Arc::new(RendezvousRegistry::default());
        let listener = registry.listen(key("s1")).unwrap();

        let worker = thread::spawn(move || {
            let handoff = listener.receiver().recv().unwrap();
            assert_eq!(handoff.notification.name, "s1");
            handoff.reply.send(Ok(StreamAction::ContinueAndStop)).unwrap();
        });

        let action = registry
            .deliver(&key("s1"), StreamNotification::new("s1", "push"))
            .unwrap();
        assert_eq!(action, StreamAction::ContinueAndStop);
        worker.join().unwrap();
        assert!(!registry.is_listening(&key("s1")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn second_listener_is_rejected_until_release() {
        let registry = RendezvousRegistry::default();
        let first = registry.listen(key("s1")).unwrap();
        let err = registry.listen(key("s1")).unwrap_err();
        assert!(matches!(
            err,
            SensorError::Execution(ExecutionError::StreamAlreadyOpen { .. })
        ));
        drop(first);
        assert!(registry.listen(key("s1")).is_ok());
    }

    #[test]
    fn released_listener_does_not_clear_its_successor() {
        let registry = RendezvousRegistry::default();
        let mut first = registry.listen(key("s1")).unwrap();
        first.release();
        assert!(!registry.is_listening(&key("s1")));

        let _second = registry.listen(key("s1")).unwrap();
        drop(first);
        assert!(registry.is_listening(&key("s1")));
    }

    #[test]
    fn idle_listener_times_out_delivery() {
        let registry = RendezvousRegistry::new(Duration::from_millis(20));
        let _listener = registry.listen(key("s1")).unwrap();
        let err = registry
            .deliver(&key("s1"), StreamNotification::new("s1", "push"))
            .unwrap_err();
        assert!(matches!(
            err,
            SensorError::Execution(ExecutionError::Timeout { duration_ms: 20 })
        ));
    }

    #[test]
    fn notification_without_event_builds_one() {
        let event = StreamNotification::new("s1", "com.example.push").into_event();
        assert_eq!(event.source(), "s1");
        assert_eq!(event.context.event_type, "com.example.push");
        assert!(event.payload.is_empty());
    }
}
