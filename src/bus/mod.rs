//! Message bus: identities, topology, routing and replies.
//!
//! This module contains the in-process bus that everything else plugs into.
//! The only mutable state is the routing topology inside [`MessageBus`];
//! messages, identities and reports are immutable snapshots.
//!
//! ## Contents
//! - [`EndpointId`] / [`MessageId`] identities with names and descriptions
//! - [`Message`] one delivered message with its optional payload
//! - [`MessageBus`] topology definition, routing, events and requests
//! - [`Replies`] / [`Reply`] the receiving end of a request
//! - [`ActivityReport`] per-dispatcher queue and in-flight counters
//!
//! ## Quick wiring
//! ```text
//! MessageBus::new()
//!   ├─ define_endpoint / define_message        (topology, up front)
//!   ├─ register_dispatcher                     (routing entries)
//!   ├─ trigger_event ──► fire and forget
//!   └─ send_request ───► Replies ──► recv / wait_all
//! ```

#[allow(clippy::module_inception)]
mod bus;
mod id;
mod message;
mod registry;
mod reply;
mod state;

pub use bus::MessageBus;
pub use id::{EndpointId, MessageId};
pub use message::{payload, Message, Payload};
pub use reply::{DispatchResult, Replies, Reply};
pub use state::{ActivityReport, DispatcherState, EndpointState};

pub(crate) use reply::ReplySlot;
