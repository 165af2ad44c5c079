//! gRPC stream transport for sensors.
//!
//! A deliverer opens one bidirectional `Stream` call and sends
//! `SignalNotification`s. Every notification is handed through the
//! rendezvous registry to the stream session of its signal, and the
//! session's decision is written back as one `SensorAction`.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::bridge::{RendezvousKey, RendezvousRegistry, StreamAction, StreamNotification, StreamSession};
use crate::error::{ExecutionError, SensorError, ValidationError};
use crate::event::Event;
use crate::sensor::{SensorRuntime, Shutdown};

pub mod proto {
    tonic::include_proto!("sensorgate");
}

use proto::sensor_action::Action;
use proto::sensor_update_server::{SensorUpdate, SensorUpdateServer};

pub use proto::sensor_update_client::SensorUpdateClient;

/// Maximum size of an embedded event JSON payload.
const MAX_EVENT_JSON_BYTES: usize = 1024 * 1024; // 1 MiB

/// Outbound action buffer per stream.
const ACTION_BUFFER: usize = 16;

/// gRPC service implementation for one sensor.
#[derive(Debug, Clone)]
pub struct SensorUpdateService {
    runtime: Arc<SensorRuntime>,
    registry: Arc<RendezvousRegistry>,
}

impl SensorUpdateService {
    #[must_use]
    pub fn new(runtime: Arc<SensorRuntime>, registry: Arc<RendezvousRegistry>) -> Self {
        Self { runtime, registry }
    }

    #[must_use]
    pub fn into_server(self) -> SensorUpdateServer<Self> {
        SensorUpdateServer::new(self)
    }
}

/// Maps a sensor error onto a gRPC status.
fn status_from_error(err: &SensorError) -> Status {
    match err {
        SensorError::Validation(v) => Status::invalid_argument(v.to_string()),
        SensorError::Execution(e) => match e {
            ExecutionError::Timeout { .. } => Status::deadline_exceeded(e.to_string()),
            ExecutionError::NoActiveStream { .. } | ExecutionError::PersistenceFailed { .. } => {
                Status::unavailable(e.to_string())
            }
            ExecutionError::StreamAlreadyOpen { .. } => Status::already_exists(e.to_string()),
            ExecutionError::TriggerFailed { .. } | ExecutionError::Preempted { .. } => {
                Status::failed_precondition(e.to_string())
            }
            ExecutionError::Disconnected { .. } => Status::internal(e.to_string()),
        },
        SensorError::Transport(t) => Status::unavailable(t.to_string()),
        SensorError::Storage(s) if s.is_not_found() => Status::not_found(s.to_string()),
        SensorError::Storage(s) if s.is_retryable() => Status::unavailable(s.to_string()),
        SensorError::Storage(s) => Status::internal(s.to_string()),
        SensorError::InvariantViolation { reason } => Status::internal(reason.clone()),
    }
}

fn decode_notification(msg: proto::SignalNotification) -> Result<StreamNotification, ValidationError> {
    if msg.name.is_empty() {
        return Err(ValidationError::MalformedNotification {
            reason: "signal name is required".to_string(),
        });
    }
    if msg.event_json.len() > MAX_EVENT_JSON_BYTES {
        return Err(ValidationError::MalformedNotification {
            reason: "event_json exceeds maximum size".to_string(),
        });
    }

    let event = if msg.event_json.is_empty() {
        None
    } else {
        let event: Event = serde_json::from_slice(&msg.event_json)
            .map_err(|e| ValidationError::MalformedNotification {
                reason: format!("invalid event JSON: {e}"),
            })?;
        if event.source() != msg.name {
            return Err(ValidationError::MalformedNotification {
                reason: format!(
                    "event source '{}' does not match signal '{}'",
                    event.source(),
                    msg.name
                ),
            });
        }
        Some(event)
    };

    Ok(StreamNotification {
        name: msg.name,
        event_type: msg.r#type,
        event,
    })
}

fn encode_action(action: StreamAction, message: impl Into<String>) -> proto::SensorAction {
    let action = match action {
        StreamAction::ContinueAndRepeat => Action::Repeat,
        StreamAction::ContinueAndStop => Action::Stop,
    };
    proto::SensorAction {
        action: action as i32,
        message: message.into(),
    }
}

/// Makes sure a session listens on `signal`'s slot.
fn ensure_session(
    runtime: &Arc<SensorRuntime>,
    registry: &RendezvousRegistry,
    signal: &str,
) -> Result<(), SensorError> {
    let key = RendezvousKey::new(runtime.key().clone(), signal);
    if registry.is_listening(&key) {
        return Ok(());
    }
    match StreamSession::open(Arc::clone(runtime), registry, signal) {
        Ok(session) => {
            session.spawn().map_err(|e| ExecutionError::Disconnected {
                path: format!("{key}: failed to spawn stream session: {e}"),
            })?;
            Ok(())
        }
        // Lost a race against another stream; someone is listening.
        Err(SensorError::Execution(ExecutionError::StreamAlreadyOpen { .. })) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Hands one notification to its session and waits for the action.
async fn deliver(
    runtime: Arc<SensorRuntime>,
    registry: Arc<RendezvousRegistry>,
    notification: StreamNotification,
) -> Result<StreamAction, SensorError> {
    tokio::task::spawn_blocking(move || {
        ensure_session(&runtime, &registry, &notification.name)?;
        let key = RendezvousKey::new(runtime.key().clone(), notification.name.clone());
        registry.deliver(&key, notification)
    })
    .await
    .map_err(|e| SensorError::invariant(format!("delivery task failed: {e}")))?
}

#[tonic::async_trait]
impl SensorUpdate for SensorUpdateService {
    type StreamStream = ReceiverStream<Result<proto::SensorAction, Status>>;

    async fn stream(
        &self,
        request: Request<Streaming<proto::SignalNotification>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        if !self.runtime.is_accepting() {
            return Err(Status::failed_precondition(format!(
                "sensor {} is not accepting notifications",
                self.runtime.key()
            )));
        }

        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<proto::SensorAction, Status>>(ACTION_BUFFER);
        let runtime = Arc::clone(&self.runtime);
        let registry = Arc::clone(&self.registry);
        let shutdown = runtime.shutdown_signal();

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    () = shutdown.wait() => {
                        info!(sensor = %runtime.key(), "closing stream on shutdown");
                        let _ = tx
                            .send(Ok(encode_action(StreamAction::ContinueAndStop, "sensor shut down")))
                            .await;
                        break;
                    }
                    msg = inbound.message() => msg,
                };

                let msg = match msg {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(status) => {
                        warn!(sensor = %runtime.key(), error = %status, "inbound stream failed");
                        break;
                    }
                };

                let notification = match decode_notification(msg) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(sensor = %runtime.key(), error = %e, "dropping stream notification");
                        let _ = tx.send(Err(Status::invalid_argument(e.to_string()))).await;
                        break;
                    }
                };

                let signal = notification.name.clone();
                match deliver(Arc::clone(&runtime), Arc::clone(&registry), notification).await {
                    Ok(action) => {
                        debug!(sensor = %runtime.key(), %signal, ?action, "stream notification handled");
                        if tx.send(Ok(encode_action(action, ""))).await.is_err() {
                            break;
                        }
                        if action == StreamAction::ContinueAndStop {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(sensor = %runtime.key(), %signal, error = %e, "stream delivery failed");
                        let _ = tx.send(Err(status_from_error(&e))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Serves the stream transport on `listener` until `shutdown` fires.
pub async fn serve_stream(
    listener: TcpListener,
    service: SensorUpdateService,
    shutdown: Shutdown,
) -> Result<(), tonic::transport::Error> {
    tonic::transport::Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.wait().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContext;
    use crate::storage::StoreError;

    #[test]
    fn decode_requires_name() {
        let err = decode_notification(proto::SignalNotification {
            name: String::new(),
            r#type: "push".to_string(),
            event_json: Vec::new(),
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedNotification { .. }));
    }

    #[test]
    fn decode_embedded_event() {
        let event = Event::new(
            EventContext::new("s1", "com.example", "v1", "application/json"),
            b"{}".to_vec(),
        );
        let n = decode_notification(proto::SignalNotification {
            name: "s1".to_string(),
            r#type: "com.example".to_string(),
            event_json: serde_json::to_vec(&event).unwrap(),
        })
        .unwrap();
        assert_eq!(n.event, Some(event));
    }

    #[test]
    fn decode_rejects_mismatched_source() {
        let event = Event::new(
            EventContext::new("s2", "com.example", "v1", "application/json"),
            Vec::new(),
        );
        let err = decode_notification(proto::SignalNotification {
            name: "s1".to_string(),
            r#type: "com.example".to_string(),
            event_json: serde_json::to_vec(&event).unwrap(),
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::MalformedNotification { .. }));
    }

    #[test]
    fn status_mapping() {
        let s = status_from_error(&SensorError::from(ValidationError::UnknownSignalSource {
            signal: "x".to_string(),
        }));
        assert_eq!(s.code(), tonic::Code::InvalidArgument);

        let s = status_from_error(&SensorError::from(ExecutionError::NoActiveStream {
            key: "k".to_string(),
        }));
        assert_eq!(s.code(), tonic::Code::Unavailable);

        let s = status_from_error(&SensorError::from(StoreError::NotFound {
            key: "k".to_string(),
        }));
        assert_eq!(s.code(), tonic::Code::NotFound);

        let s = status_from_error(&SensorError::from(ExecutionError::Preempted {
            sensor: "ci/build".to_string(),
        }));
        assert_eq!(s.code(), tonic::Code::FailedPrecondition);

        let s = status_from_error(&SensorError::invariant("bad"));
        assert_eq!(s.code(), tonic::Code::Internal);
    }

    #[test]
    fn action_encoding() {
        let a = encode_action(StreamAction::ContinueAndStop, "done");
        assert_eq!(a.action, Action::Stop as i32);
        assert_eq!(a.message, "done");
        assert_eq!(
            encode_action(StreamAction::ContinueAndRepeat, "").action,
            Action::Repeat as i32
        );
    }
}
