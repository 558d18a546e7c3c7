//! # The message bus: topology, routing and delivery.
//!
//! [`MessageBus`] routes messages between loosely coupled components. The
//! topology (which endpoints exist and which messages they carry) is defined
//! up front; dispatchers then register for `(message, endpoint, entity)`
//! combinations and receive matching events and requests.
//!
//! ## Diagram
//! ```text
//!   define_endpoint ──► define_message ──► register_dispatcher
//!                                               │
//!   trigger_event ───► routing tables ──► deliver (no reply)
//!   send_request  ───► routing tables ──► deliver ──► Replies
//! ```
//!
//! ## Rules
//! - Events route on the sender: only dispatchers registered on the sending
//!   endpoint receive them. A sender that does not carry the message
//!   triggers nothing, silently.
//! - Requests route on the receiver: one endpoint, or every endpoint that
//!   carries the message. Unknown messages and unmatched receivers yield an
//!   empty reply set instead of an error.
//! - An entity-scoped request skips wildcard registrations; an entity-scoped
//!   event reaches both the wildcard and the exact entity.
//! - Delivery order is by descending dispatcher priority; ties keep
//!   registration order.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::bus::id::{EndpointId, MessageId};
use crate::bus::message::{Message, Payload};
use crate::bus::registry::Topology;
use crate::bus::reply::{reply_channel, Replies, ReplySlot};
use crate::bus::state::ActivityReport;
use crate::dispatch::{DispatchCore, Dispatcher, Subscription};
use crate::error::BusError;

/// How often activity is re-checked while waiting for the bus to go idle.
const ACTIVITY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// In-process message bus with explicit topology.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use testrig::{Dispatcher, EndpointId, HandlerFn, Message, MessageBus, MessageId, Subscription};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let bus = MessageBus::new();
/// let sut = EndpointId::new("sut", "system under test");
/// let power_on = MessageId::new("POWER_ON", "turn the power on");
/// bus.define_endpoint(&sut)?;
/// bus.define_message(&power_on, &sut)?;
///
/// let dispatcher = Dispatcher::callback(
///     &bus,
///     HandlerFn::arc("power-log", |_message: Message| async { Ok(None) }),
/// );
/// dispatcher.register(&Subscription::new([power_on.clone()]))?;
///
/// bus.trigger_event(&power_on, &sut, None, None).await?;
/// dispatcher.destroy().await;
/// # Ok::<(), testrig::BusError>(())
/// # }).unwrap();
/// ```
pub struct MessageBus {
    topology: RwLock<Topology>,
}

impl MessageBus {
    /// Creates an empty bus with no endpoints or messages defined.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(MessageBus {
            topology: RwLock::new(Topology::default()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Topology> {
        self.topology.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Topology> {
        self.topology.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Defines an endpoint.
    ///
    /// # Errors
    /// [`BusError::EndpointAlreadyDefined`] when the endpoint is already
    /// part of the topology.
    pub fn define_endpoint(&self, endpoint: &EndpointId) -> Result<(), BusError> {
        tracing::debug!(endpoint = %endpoint, "defining endpoint");
        self.write().define_endpoint(endpoint)
    }

    /// Defines a message on an endpoint. The endpoint must already be
    /// defined; defining the same pair twice is an error.
    pub fn define_message(&self, message: &MessageId, endpoint: &EndpointId) -> Result<(), BusError> {
        tracing::debug!(message = %message, endpoint = %endpoint, "defining message");
        self.write().define_message(message, endpoint)
    }

    /// Defines several endpoints, each with its messages, in one call.
    /// Definitions are applied in order and the first failure aborts the
    /// rest.
    pub fn define_endpoints_and_messages(
        &self,
        definitions: impl IntoIterator<Item = (EndpointId, Vec<MessageId>)>,
    ) -> Result<(), BusError> {
        let mut topology = self.write();
        for (endpoint, messages) in definitions {
            topology.define_endpoint(&endpoint)?;
            for message in &messages {
                topology.define_message(message, &endpoint)?;
            }
        }
        Ok(())
    }

    /// Whether the endpoint is defined.
    #[must_use]
    pub fn is_endpoint_defined(&self, endpoint: &EndpointId) -> bool {
        self.read().is_endpoint_defined(endpoint)
    }

    /// Whether the message is defined for the endpoint.
    #[must_use]
    pub fn is_message_defined_for_endpoint(&self, message: &MessageId, endpoint: &EndpointId) -> bool {
        self.read().is_message_defined_for_endpoint(message, endpoint)
    }

    /// Every defined message with the endpoints that carry it, in
    /// definition order.
    #[must_use]
    pub fn defined_messages_and_endpoints(&self) -> Vec<(MessageId, Vec<EndpointId>)> {
        self.read().defined_messages_and_endpoints()
    }

    /// Every defined endpoint with the messages it carries, in definition
    /// order.
    #[must_use]
    pub fn defined_endpoints_and_messages(&self) -> Vec<(EndpointId, Vec<MessageId>)> {
        self.read().defined_endpoints_and_messages()
    }

    /// Adds routing entries for the dispatcher.
    ///
    /// The subscription's endpoints default to every endpoint each message
    /// is defined for, and its entities default to the wildcard. The whole
    /// subscription is validated before anything is modified.
    ///
    /// # Errors
    /// [`BusError::MessagesRequired`] on an empty message set,
    /// [`BusError::NoSuchMessage`] and [`BusError::NoSuchEndpoint`] on
    /// unknown topology.
    pub fn register_dispatcher(
        &self,
        dispatcher: &Dispatcher,
        subscription: &Subscription,
    ) -> Result<(), BusError> {
        if subscription.messages().is_empty() {
            return Err(BusError::MessagesRequired);
        }
        tracing::debug!(dispatcher = %dispatcher.name(), "registering dispatcher");
        self.write().register(
            dispatcher.core(),
            subscription.messages(),
            subscription.endpoints(),
            subscription.entities(),
        )
    }

    /// Removes the matching routing entries. An empty message set removes
    /// every registration of the dispatcher.
    ///
    /// Returns whether the dispatcher still has registrations left.
    pub fn deregister_dispatcher(
        &self,
        dispatcher: &Dispatcher,
        subscription: &Subscription,
    ) -> Result<bool, BusError> {
        tracing::debug!(dispatcher = %dispatcher.name(), "deregistering dispatcher");
        self.write().deregister(
            dispatcher.core(),
            subscription.messages(),
            subscription.endpoints(),
            subscription.entities(),
        )
    }

    /// Removes every registration of the dispatcher, reporting whether any
    /// existed. Unlike [`MessageBus::deregister_dispatcher`] this never
    /// fails.
    pub fn remove_dispatcher(&self, dispatcher: &Dispatcher) -> bool {
        self.write().remove_everywhere(dispatcher.core())
    }

    /// Whether the dispatcher has at least one registration.
    #[must_use]
    pub fn dispatcher_is_registered(&self, dispatcher: &Dispatcher) -> bool {
        self.read().still_registered(dispatcher.core())
    }

    /// Whether any dispatcher is registered for the message on the
    /// endpoint. `entity` of `None` checks the wildcard registration.
    #[must_use]
    pub fn has_registered_dispatchers(
        &self,
        message: &MessageId,
        endpoint: &EndpointId,
        entity: Option<&str>,
    ) -> bool {
        let entity: Option<Arc<str>> = entity.map(Arc::from);
        self.read().has_registered(message, endpoint, entity.as_ref())
    }

    /// Sends an event from `sender` to every matching dispatcher.
    ///
    /// Nothing is delivered when the sender does not carry the message.
    /// Delivery is sequential in descending priority order; queueing
    /// strategies return immediately after enqueueing.
    ///
    /// # Errors
    /// [`BusError::NoSuchMessage`] when the message is not defined at all.
    pub async fn trigger_event(
        &self,
        message: &MessageId,
        sender: &EndpointId,
        entity: Option<&str>,
        data: Option<Payload>,
    ) -> Result<(), BusError> {
        let entity: Option<Arc<str>> = entity.map(Arc::from);
        let mut deliveries = {
            self.read()
                .collect_event_targets(message, sender, entity.as_ref())?
        };
        tracing::debug!(
            message = %message,
            endpoint = %sender,
            entity = ?entity,
            targets = deliveries.len(),
            "triggering event"
        );
        deliveries.sort_by_key(|delivery| std::cmp::Reverse(delivery.core.priority()));
        for delivery in deliveries {
            let outgoing = Message::new(
                message.clone(),
                Some(sender.clone()),
                delivery.entity,
                data.clone(),
            );
            delivery.core.deliver(outgoing, None).await;
        }
        Ok(())
    }

    /// Sends a request and returns one [`Replies`] entry per matching
    /// dispatcher.
    ///
    /// `receiver` of `None` addresses every endpoint that carries the
    /// message. Unknown messages and unmatched receivers return an empty
    /// reply set. Replies keep registration order even though dispatch
    /// itself runs in descending priority order.
    pub async fn send_request(
        &self,
        message: &MessageId,
        receiver: Option<&EndpointId>,
        entity: Option<&str>,
        data: Option<Payload>,
    ) -> Replies {
        let entity: Option<Arc<str>> = entity.map(Arc::from);
        let deliveries = {
            self.read()
                .collect_request_targets(message, receiver, entity.as_ref())
        };
        tracing::debug!(
            message = %message,
            endpoint = receiver.map(|endpoint| endpoint.name().as_ref()).unwrap_or("*"),
            entity = ?entity,
            targets = deliveries.len(),
            "sending request"
        );
        let mut replies = Vec::with_capacity(deliveries.len());
        let mut outgoing: Vec<(Arc<DispatchCore>, Message, ReplySlot)> =
            Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let (slot, reply) = reply_channel(delivery.core.name_arc());
            let request = Message::new(
                message.clone(),
                receiver.cloned(),
                delivery.entity,
                data.clone(),
            );
            replies.push(reply);
            outgoing.push((delivery.core, request, slot));
        }
        outgoing.sort_by_key(|(core, _, _)| std::cmp::Reverse(core.priority()));
        for (core, request, slot) in outgoing {
            core.deliver(request, Some(slot)).await;
        }
        Replies::new(replies)
    }

    /// Snapshot of dispatcher activity, for one endpoint or all of them.
    pub fn get_state(&self, endpoint: Option<&EndpointId>) -> Result<ActivityReport, BusError> {
        let endpoints = self.read().endpoint_states(endpoint)?;
        Ok(ActivityReport { endpoints })
    }

    /// Whether any dispatcher on the endpoint (or anywhere, for `None`)
    /// has queued or in-flight messages.
    pub fn is_active(&self, endpoint: Option<&EndpointId>) -> Result<bool, BusError> {
        Ok(self.get_state(endpoint)?.is_active())
    }

    /// Polls until the endpoint (or the whole bus, for `None`) goes idle.
    ///
    /// # Errors
    /// [`BusError::Timeout`] carrying a report of the still-busy
    /// dispatchers when `timeout` elapses first.
    pub async fn wait_for_not_active(
        &self,
        endpoint: Option<&EndpointId>,
        timeout: Duration,
    ) -> Result<(), BusError> {
        let start = Instant::now();
        loop {
            if !self.is_active(endpoint)? {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                let report = self.get_state(None)?.busy_report();
                return Err(BusError::Timeout {
                    report: report.into(),
                });
            }
            tokio::time::sleep(ACTIVITY_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::payload;
    use crate::dispatch::HandlerFn;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    type Log = Arc<Mutex<Vec<(String, Option<String>)>>>;

    fn recorder(bus: &Arc<MessageBus>, name: &'static str, log: &Log) -> Dispatcher {
        let log = Arc::clone(log);
        Dispatcher::callback(
            bus,
            HandlerFn::arc(name, move |message: Message| {
                let log = Arc::clone(&log);
                async move {
                    log.lock()
                        .unwrap()
                        .push((name.to_string(), message.entity().map(str::to_string)));
                    Ok(None)
                }
            }),
        )
    }

    fn wired() -> (Arc<MessageBus>, MessageId, EndpointId) {
        let bus = MessageBus::new();
        let message = MessageId::new("POWER_ON", "turn the power on");
        let endpoint = EndpointId::new("sut", "system under test");
        bus.define_endpoint(&endpoint).unwrap();
        bus.define_message(&message, &endpoint).unwrap();
        (bus, message, endpoint)
    }

    #[tokio::test]
    async fn test_trigger_unknown_message_errors() {
        let (bus, _message, endpoint) = wired();
        let unknown = MessageId::new("UNKNOWN", "never defined");
        let err = bus
            .trigger_event(&unknown, &endpoint, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no such message 'UNKNOWN'");
    }

    #[tokio::test]
    async fn test_trigger_from_endpoint_without_message_is_silent() {
        let (bus, message, _endpoint) = wired();
        let other = EndpointId::new("other", "does not carry POWER_ON");
        bus.define_endpoint(&other).unwrap();

        let log: Log = Arc::default();
        let dispatcher = recorder(&bus, "listener", &log);
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        bus.trigger_event(&message, &other, None, None).await.unwrap();
        assert!(log.lock().unwrap().is_empty(), "nothing should be delivered");
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_event_entity_routing() {
        let (bus, message, endpoint) = wired();
        let log: Log = Arc::default();
        let wildcard = recorder(&bus, "wildcard", &log);
        let scoped = recorder(&bus, "scoped", &log);
        wildcard.register(&Subscription::new([message.clone()])).unwrap();
        scoped
            .register(&Subscription::new([message.clone()]).with_entity("db"))
            .unwrap();

        // No entity: wildcard only, with no entity on the message.
        bus.trigger_event(&message, &endpoint, None, None).await.unwrap();
        // Matching entity: wildcard and the exact registration, both seeing
        // the triggering entity.
        bus.trigger_event(&message, &endpoint, Some("db"), None).await.unwrap();
        // Non-matching entity: wildcard only.
        bus.trigger_event(&message, &endpoint, Some("net"), None).await.unwrap();

        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("wildcard".to_string(), None),
                ("wildcard".to_string(), Some("db".to_string())),
                ("scoped".to_string(), Some("db".to_string())),
                ("wildcard".to_string(), Some("net".to_string())),
            ]
        );
        wildcard.destroy().await;
        scoped.destroy().await;
    }

    #[tokio::test]
    async fn test_request_entity_routing() {
        let (bus, message, endpoint) = wired();
        let log: Log = Arc::default();
        let wildcard = recorder(&bus, "wildcard", &log);
        let scoped = recorder(&bus, "scoped", &log);
        wildcard.register(&Subscription::new([message.clone()])).unwrap();
        scoped
            .register(&Subscription::new([message.clone()]).with_entity("db"))
            .unwrap();

        // Entity-scoped requests skip the wildcard registration.
        let replies = bus
            .send_request(&message, Some(&endpoint), Some("db"), None)
            .await;
        assert_eq!(replies.len(), 1);

        // Unscoped requests reach every registration; the wildcard target
        // sees no entity and the scoped target sees its own key.
        let replies = bus.send_request(&message, Some(&endpoint), None, None).await;
        assert_eq!(replies.len(), 2);

        let seen = log.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("scoped".to_string(), Some("db".to_string())),
                ("wildcard".to_string(), None),
                ("scoped".to_string(), Some("db".to_string())),
            ]
        );
        wildcard.destroy().await;
        scoped.destroy().await;
    }

    #[tokio::test]
    async fn test_request_without_targets_returns_no_replies() {
        let (bus, message, _endpoint) = wired();
        let unknown_message = MessageId::new("UNKNOWN", "never defined");
        let unknown_endpoint = EndpointId::new("elsewhere", "never defined");

        let replies = bus.send_request(&unknown_message, None, None, None).await;
        assert!(replies.is_empty(), "unknown message must not error");

        let replies = bus
            .send_request(&message, Some(&unknown_endpoint), None, None)
            .await;
        assert!(replies.is_empty(), "unmatched receiver must not error");
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let (bus, message, endpoint) = wired();
        let dispatcher = Dispatcher::callback(
            &bus,
            HandlerFn::arc("doubler", |message: Message| async move {
                let value = message.data_as::<u32>().copied().unwrap_or(0);
                Ok(Some(payload(value * 2)))
            }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        let replies = bus
            .send_request(&message, Some(&endpoint), None, Some(payload(21u32)))
            .await;
        assert_eq!(replies.len(), 1);
        for reply in replies {
            assert_eq!(reply.dispatcher(), "doubler");
            let value = reply.recv().await.unwrap();
            assert_eq!(value.unwrap().downcast_ref::<u32>(), Some(&42));
        }
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_request_reports_handler_failure() {
        let (bus, message, endpoint) = wired();
        let dispatcher = Dispatcher::callback(
            &bus,
            HandlerFn::arc("refuser", |_message: Message| async {
                Err("power supply missing".into())
            }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        let replies = bus.send_request(&message, Some(&endpoint), None, None).await;
        let results = replies.wait_all(Duration::from_secs(1)).await;
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(error) => {
                assert_eq!(error.to_string(), "handler failed: power supply missing");
            }
            Ok(_) => panic!("expected a failed reply"),
        }
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_priority_orders_delivery() {
        let (bus, message, endpoint) = wired();
        let log: Log = Arc::default();
        let low = recorder(&bus, "low", &log).with_priority(-1);
        let tie_first = recorder(&bus, "tie-first", &log);
        let tie_second = recorder(&bus, "tie-second", &log);
        let high = recorder(&bus, "high", &log).with_priority(7);
        for dispatcher in [&low, &tie_first, &tie_second, &high] {
            dispatcher.register(&Subscription::new([message.clone()])).unwrap();
        }

        bus.trigger_event(&message, &endpoint, None, None).await.unwrap();

        let order: Vec<String> = log.lock().unwrap().iter().map(|(name, _)| name.clone()).collect();
        assert_eq!(order, vec!["high", "tie-first", "tie-second", "low"]);
        for dispatcher in [low, tie_first, tie_second, high] {
            dispatcher.destroy().await;
        }
    }

    #[tokio::test]
    async fn test_replies_keep_registration_order() {
        let (bus, message, endpoint) = wired();
        let log: Log = Arc::default();
        let first = recorder(&bus, "registered-first", &log).with_priority(1);
        let second = recorder(&bus, "registered-second", &log).with_priority(9);
        first.register(&Subscription::new([message.clone()])).unwrap();
        second.register(&Subscription::new([message.clone()])).unwrap();

        let replies = bus.send_request(&message, Some(&endpoint), None, None).await;
        // Dispatch ran high priority first, the reply set does not.
        let dispatched: Vec<String> =
            log.lock().unwrap().iter().map(|(name, _)| name.clone()).collect();
        assert_eq!(dispatched, vec!["registered-second", "registered-first"]);
        let names: Vec<String> = replies
            .into_iter()
            .map(|reply| reply.dispatcher().to_string())
            .collect();
        assert_eq!(names, vec!["registered-first", "registered-second"]);
        first.destroy().await;
        second.destroy().await;
    }

    #[tokio::test]
    async fn test_definition_error_matrix() {
        let (bus, message, endpoint) = wired();
        let err = bus.define_endpoint(&endpoint).unwrap_err();
        assert_eq!(err.to_string(), "endpoint 'sut' already defined");

        let err = bus.define_message(&message, &endpoint).unwrap_err();
        assert_eq!(
            err.to_string(),
            "endpoint 'sut' already defined for message 'POWER_ON'"
        );

        let unknown = EndpointId::new("ghost", "never defined");
        let err = bus.define_message(&message, &unknown).unwrap_err();
        assert_eq!(err.to_string(), "no such endpoint 'ghost' for message 'POWER_ON'");
    }

    #[tokio::test]
    async fn test_define_endpoints_and_messages_bulk() {
        let bus = MessageBus::new();
        let sut = EndpointId::new("sut", "system under test");
        let logs = EndpointId::new("logs", "log collector");
        let power = MessageId::new("POWER_ON", "turn the power on");
        let line = MessageId::new("LOG_LINE", "one captured log line");

        bus.define_endpoints_and_messages([
            (sut.clone(), vec![power.clone(), line.clone()]),
            (logs.clone(), vec![line.clone()]),
        ])
        .unwrap();

        assert!(bus.is_message_defined_for_endpoint(&line, &logs));
        let defined = bus.defined_endpoints_and_messages();
        assert_eq!(defined.len(), 2);
        assert_eq!(defined[0].0, sut);
        assert_eq!(defined[0].1, vec![power.clone(), line.clone()]);

        let by_message = bus.defined_messages_and_endpoints();
        assert_eq!(by_message.len(), 2);
        assert_eq!(by_message[1].0, line);
        assert_eq!(by_message[1].1, vec![sut, logs]);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (bus, message, _endpoint) = wired();
        let log: Log = Arc::default();
        let dispatcher = recorder(&bus, "strict", &log);

        let err = bus
            .register_dispatcher(&dispatcher, &Subscription::default())
            .unwrap_err();
        assert!(matches!(err, BusError::MessagesRequired));

        let ghost = EndpointId::new("ghost", "never defined");
        let err = bus
            .register_dispatcher(
                &dispatcher,
                &Subscription::new([message.clone()]).with_endpoint(&ghost),
            )
            .unwrap_err();
        assert!(matches!(err, BusError::NoSuchEndpoint { .. }));
        assert!(
            !bus.dispatcher_is_registered(&dispatcher),
            "failed registration must not leave partial routes"
        );
    }

    #[tokio::test]
    async fn test_deregister_unknown_dispatcher_errors() {
        let (bus, message, _endpoint) = wired();
        let log: Log = Arc::default();
        let dispatcher = recorder(&bus, "stranger", &log);

        let err = bus
            .deregister_dispatcher(&dispatcher, &Subscription::new([message.clone()]))
            .unwrap_err();
        assert!(matches!(err, BusError::NoSuchDispatcher { .. }));

        let err = bus
            .deregister_dispatcher(&dispatcher, &Subscription::default())
            .unwrap_err();
        assert!(matches!(err, BusError::NoSuchDispatcher { .. }));

        assert!(!bus.remove_dispatcher(&dispatcher));
    }

    #[tokio::test]
    async fn test_get_state_unknown_endpoint_errors() {
        let (bus, _message, _endpoint) = wired();
        let ghost = EndpointId::new("ghost", "never defined");
        let err = bus.get_state(Some(&ghost)).unwrap_err();
        assert_eq!(err.to_string(), "no such endpoint 'ghost'");
        assert!(!bus.is_active(None).unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_not_active_reports_busy_dispatchers() {
        let (bus, message, endpoint) = wired();
        let gate = Arc::new(Semaphore::new(0));
        let permits = Arc::clone(&gate);
        let dispatcher = Dispatcher::sequential(
            &bus,
            HandlerFn::arc("gated", move |_message: Message| {
                let permits = Arc::clone(&permits);
                async move {
                    permits.acquire().await?.forget();
                    Ok(None)
                }
            }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        bus.trigger_event(&message, &endpoint, None, None).await.unwrap();
        bus.trigger_event(&message, &endpoint, None, None).await.unwrap();

        let err = bus
            .wait_for_not_active(None, Duration::ZERO)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(
            text.starts_with("Waiting for MessageBus activity to stop timed out:\n"),
            "unexpected report header: {text}"
        );
        assert!(text.contains("  sut:"), "missing endpoint line: {text}");
        assert!(
            text.contains("    gated: queue_count="),
            "missing dispatcher line: {text}"
        );

        gate.add_permits(2);
        bus.wait_for_not_active(None, Duration::from_secs(5)).await.unwrap();
        dispatcher.destroy().await;
    }
}
