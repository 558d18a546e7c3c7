//! Message handling: handlers, strategies, dispatchers and queues.
//!
//! This module groups everything that decides **how** a delivered message is
//! handled once the bus has picked its targets.
//!
//! ## Contents
//! - [`Handle`] the handler trait, with [`HandlerFn`] for closures and
//!   [`MessageFilter`] for predicate wrappers
//! - [`DispatchStrategy`] where handlers run (inline / 1 worker / task per
//!   message / fixed pool)
//! - [`Dispatcher`] the registration handle, built from a handler and a
//!   strategy, with [`Subscription`] describing what it receives
//! - [`LocalMessageQueue`] pull-style consumption instead of callbacks
//!
//! ## Quick wiring
//! ```text
//! Dispatcher::sequential(&bus, handler).register(&Subscription::new([id]))
//!      └─► MessageBus routes matching messages
//!           └─► strategy decides: inline call or queue + workers
//! ```

mod dispatcher;
mod handler;
mod local_queue;
mod strategy;

pub use dispatcher::{Dispatcher, Subscription};
pub use handler::{BoxError, Handle, HandlerFn, HandlerResult, MessageFilter};
pub use local_queue::LocalMessageQueue;
pub use strategy::DispatchStrategy;

pub(crate) use dispatcher::DispatchCore;
pub(crate) use handler::panic_message;
