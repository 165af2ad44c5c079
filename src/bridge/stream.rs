//! Stream session: the receiving end of one rendezvous slot.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};

use crate::error::SensorResult;
use crate::sensor::{NodePhase, NotificationOutcome, SensorRuntime};

use super::rendezvous::{Listener, RendezvousKey, RendezvousRegistry, StreamAction};

/// How often an idle session checks for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Listens on one signal's slot and feeds handoffs to the sensor.
///
/// The slot is released when the session ends, after a `ContinueAndStop`
/// or once the sensor shuts down.
#[derive(Debug)]
pub struct StreamSession {
    runtime: Arc<SensorRuntime>,
    listener: Listener,
}

impl StreamSession {
    /// Claims the slot for `signal` and marks its stream as established.
    pub fn open(
        runtime: Arc<SensorRuntime>,
        registry: &RendezvousRegistry,
        signal: &str,
    ) -> SensorResult<Self> {
        let key = RendezvousKey::new(runtime.key().clone(), signal);
        let listener = registry.listen(key)?;
        runtime.stream_established(signal)?;
        info!(sensor = %runtime.key(), signal, "stream established");
        Ok(Self { runtime, listener })
    }

    #[must_use]
    pub const fn key(&self) -> &RendezvousKey {
        self.listener.key()
    }

    /// Decides whether more notifications are expected on this signal.
    fn next_action(&self) -> StreamAction {
        if !self.runtime.is_accepting() {
            return StreamAction::ContinueAndStop;
        }
        let Ok(sensor) = self.runtime.snapshot() else {
            return StreamAction::ContinueAndStop;
        };
        let signal_done = sensor
            .node(&self.key().signal)
            .is_some_and(|n| n.phase == NodePhase::Complete);
        if signal_done && !sensor.spec.repeat {
            StreamAction::ContinueAndStop
        } else {
            StreamAction::ContinueAndRepeat
        }
    }

    /// Serves handoffs until the stream is told to stop or the sensor shuts down.
    pub fn run(mut self) {
        let shutdown = self.runtime.shutdown_signal();
        loop {
            if shutdown.is_triggered() {
                debug!(key = %self.key(), "stream session closed by shutdown");
                break;
            }

            let handoff = match self.listener.receiver().recv_timeout(SHUTDOWN_POLL) {
                Ok(handoff) => handoff,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let notification = handoff.notification;
            if notification.name != self.key().signal {
                warn!(key = %self.key(), name = %notification.name, "notification delivered to the wrong slot");
            }

            let result = self
                .runtime
                .handle_notification(notification.into_event())
                .map(|outcome| {
                    if let NotificationOutcome::Dropped(e) = &outcome {
                        debug!(key = %self.key(), error = %e, "stream notification dropped");
                    }
                    self.next_action()
                });

            let stop = matches!(result, Ok(StreamAction::ContinueAndStop));
            if stop {
                // The next stream for this signal may start as soon as the
                // deliverer sees the reply.
                self.listener.release();
            }
            if handoff.reply.send(result).is_err() {
                warn!(key = %self.key(), "deliverer went away before the action was sent");
            }
            if stop {
                info!(key = %self.key(), "stream closed");
                break;
            }
        }
    }

    /// Runs the session on a named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("sensor-stream-{}", self.key().signal))
            .spawn(move || self.run())
    }
}
