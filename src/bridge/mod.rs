//! Notification bridge: the receiving side of event delivery.
//!
//! Events reach a sensor either by HTTP push ([`push`]) or through a
//! rendezvous slot served by a [`StreamSession`]. Both paths end in
//! [`crate::sensor::SensorRuntime::handle_notification`].

pub mod push;
mod rendezvous;
mod stream;

pub use push::{push_router, serve_push};
pub use rendezvous::{
    Handoff, Listener, RendezvousKey, RendezvousRegistry, StreamAction, StreamNotification,
    DEFAULT_HANDOFF_TIMEOUT,
};
pub use stream::StreamSession;
