//! # Dispatchers: the subscription handles of the bus.
//!
//! A [`Dispatcher`] couples a handler with a [`DispatchStrategy`] and a bus.
//! Registering it creates routing entries; from then on matching events and
//! requests are delivered according to the strategy.
//!
//! ## Lifecycle
//! ```text
//!   register ──► routes added ──► workers started
//!       │
//!   deregister ─► routes removed ─► workers stopped when none remain
//!       │
//!   destroy ───► all routes removed, workers stopped (idempotent)
//! ```
//!
//! ## Rules
//! - `register` with an empty message set is an error; `deregister` with an
//!   empty message set removes every registration of the dispatcher.
//! - `destroy` never fails: it is safe on a never-registered or already
//!   destroyed dispatcher.
//! - Stopping drains the queue: already accepted messages are handled
//!   before the workers exit.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::bus::{DispatchResult, EndpointId, Message, MessageBus, MessageId, ReplySlot};
use crate::dispatch::handler::{panic_message, Handle};
use crate::dispatch::strategy::{DispatchStrategy, Job, WorkerState};
use crate::error::{BusError, DispatchError};

/// Shared dispatch state referenced by the routing tables.
///
/// The core outlives its `Dispatcher` handles for as long as the bus holds
/// routes to it; identity in the routing tables is the `Arc` pointer.
pub(crate) struct DispatchCore {
    name: Arc<str>,
    priority: AtomicI32,
    strategy: DispatchStrategy,
    handler: Arc<dyn Handle>,
    active: AtomicUsize,
    queued: AtomicUsize,
    worker: Mutex<WorkerState>,
}

impl DispatchCore {
    pub(crate) fn new(
        name: impl Into<Arc<str>>,
        strategy: DispatchStrategy,
        handler: Arc<dyn Handle>,
        priority: i32,
    ) -> Arc<Self> {
        Arc::new(DispatchCore {
            name: name.into(),
            priority: AtomicI32::new(priority),
            strategy,
            handler,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            worker: Mutex::new(WorkerState::default()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority.load(AtomicOrdering::Relaxed)
    }

    fn set_priority(&self, priority: i32) {
        self.priority.store(priority, AtomicOrdering::Relaxed);
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn queue_count(&self) -> usize {
        self.queued.load(AtomicOrdering::SeqCst)
    }

    fn worker_state(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the queue workers. Idempotent; queue-less strategies are a
    /// no-op.
    pub(crate) fn start(self: &Arc<Self>) {
        let workers = self.strategy.worker_count();
        if workers == 0 {
            return;
        }
        let mut state = self.worker_state();
        if state.sender.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(AsyncMutex::new(rx));
        state.sender = Some(tx);
        for _ in 0..workers {
            state
                .tasks
                .push(tokio::spawn(Self::worker_loop(Arc::clone(self), Arc::clone(&rx))));
        }
    }

    /// Closes the queue and awaits every worker and in-flight task.
    /// Accepted messages are drained, not dropped.
    pub(crate) async fn stop(&self) {
        let state = {
            let mut worker = self.worker_state();
            std::mem::take(&mut *worker)
        };
        drop(state.sender);
        for task in state.tasks {
            let _ = task.await;
        }
    }

    /// Delivers one message according to the strategy.
    pub(crate) async fn deliver(self: &Arc<Self>, message: Message, reply: Option<ReplySlot>) {
        match self.strategy {
            DispatchStrategy::Callback => {
                self.active.fetch_add(1, AtomicOrdering::SeqCst);
                Self::invoke(&self.handler, message, reply).await;
                self.active.fetch_sub(1, AtomicOrdering::SeqCst);
            }
            DispatchStrategy::Concurrent => {
                self.queued.fetch_add(1, AtomicOrdering::SeqCst);
                let core = Arc::clone(self);
                let task = tokio::spawn(async move {
                    core.active.fetch_add(1, AtomicOrdering::SeqCst);
                    core.queued.fetch_sub(1, AtomicOrdering::SeqCst);
                    Self::invoke(&core.handler, message, reply).await;
                    core.active.fetch_sub(1, AtomicOrdering::SeqCst);
                });
                let mut state = self.worker_state();
                state.tasks.retain(|task| !task.is_finished());
                state.tasks.push(task);
            }
            DispatchStrategy::Sequential | DispatchStrategy::Pool(_) => {
                let sender = self.worker_state().sender.clone();
                let Some(sender) = sender else {
                    tracing::debug!(dispatcher = %self.name, "dispatcher not started, dropping message");
                    return;
                };
                self.queued.fetch_add(1, AtomicOrdering::SeqCst);
                if sender.send(Job { message, reply }).is_err() {
                    self.queued.fetch_sub(1, AtomicOrdering::SeqCst);
                    tracing::debug!(dispatcher = %self.name, "dispatcher stopped, dropping message");
                }
            }
        }
    }

    async fn worker_loop(core: Arc<DispatchCore>, rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Job>>>) {
        loop {
            // Hold the lock only for the pickup so workers process in
            // parallel while the queue stays FIFO.
            let job = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { break };
            core.active.fetch_add(1, AtomicOrdering::SeqCst);
            core.queued.fetch_sub(1, AtomicOrdering::SeqCst);
            Self::invoke(&core.handler, job.message, job.reply).await;
            core.active.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }

    /// Runs the handler with the panic boundary and routes the outcome
    /// into the reply slot.
    async fn invoke(handler: &Arc<dyn Handle>, message: Message, reply: Option<ReplySlot>) {
        let outcome = std::panic::AssertUnwindSafe(handler.on_message(message))
            .catch_unwind()
            .await;
        let result: DispatchResult = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                tracing::warn!(dispatcher = handler.name(), error = %error, "handler failed");
                Err(DispatchError::Failed {
                    error: error.to_string().into(),
                })
            }
            Err(panic) => {
                let text = panic_message(panic);
                tracing::warn!(dispatcher = handler.name(), error = %text, "handler panicked");
                Err(DispatchError::Panicked { error: text.into() })
            }
        };
        if let Some(slot) = reply {
            slot.resolve(result);
        }
    }
}

/// What to (de)register a dispatcher for.
///
/// Endpoints default to every endpoint the message is defined for; entities
/// default to the wildcard on registration and to every key on
/// deregistration.
///
/// # Example
/// ```
/// use testrig::{MessageId, Subscription};
///
/// let ping = MessageId::new("PING", "ping");
/// let subscription = Subscription::new([ping]).with_entity("db");
/// ```
#[derive(Clone, Debug, Default)]
pub struct Subscription {
    messages: Vec<MessageId>,
    endpoints: Vec<EndpointId>,
    entities: Vec<Arc<str>>,
}

impl Subscription {
    /// Subscribes to the given messages. An empty set is only meaningful
    /// for deregistration, where it matches every registration.
    pub fn new(messages: impl IntoIterator<Item = MessageId>) -> Self {
        Subscription {
            messages: messages.into_iter().collect(),
            endpoints: Vec::new(),
            entities: Vec::new(),
        }
    }

    /// Restricts the subscription to one endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: &EndpointId) -> Self {
        self.endpoints.push(endpoint.clone());
        self
    }

    /// Restricts the subscription to the given endpoints.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = EndpointId>) -> Self {
        self.endpoints.extend(endpoints);
        self
    }

    /// Restricts the subscription to one entity key.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<Arc<str>>) -> Self {
        self.entities.push(entity.into());
        self
    }

    /// Restricts the subscription to the given entity keys.
    #[must_use]
    pub fn with_entities(mut self, entities: impl IntoIterator<Item = impl Into<Arc<str>>>) -> Self {
        self.entities.extend(entities.into_iter().map(Into::into));
        self
    }

    pub(crate) fn messages(&self) -> &[MessageId] {
        &self.messages
    }

    pub(crate) fn endpoints(&self) -> &[EndpointId] {
        &self.endpoints
    }

    pub(crate) fn entities(&self) -> &[Arc<str>] {
        &self.entities
    }
}

/// A handler bound to a bus with a delivery strategy.
#[derive(Clone)]
pub struct Dispatcher {
    bus: Arc<MessageBus>,
    core: Arc<DispatchCore>,
}

impl Dispatcher {
    fn with_strategy(
        bus: &Arc<MessageBus>,
        strategy: DispatchStrategy,
        handler: Arc<dyn Handle>,
    ) -> Self {
        let name: Arc<str> = handler.name().into();
        Dispatcher {
            bus: Arc::clone(bus),
            core: DispatchCore::new(name, strategy, handler, 0),
        }
    }

    /// Runs the handler inline on the sending task.
    pub fn callback(bus: &Arc<MessageBus>, handler: Arc<dyn Handle>) -> Self {
        Self::with_strategy(bus, DispatchStrategy::Callback, handler)
    }

    /// Runs the handler on a single worker in delivery order.
    pub fn sequential(bus: &Arc<MessageBus>, handler: Arc<dyn Handle>) -> Self {
        Self::with_strategy(bus, DispatchStrategy::Sequential, handler)
    }

    /// Spawns one task per delivered message.
    pub fn concurrent(bus: &Arc<MessageBus>, handler: Arc<dyn Handle>) -> Self {
        Self::with_strategy(bus, DispatchStrategy::Concurrent, handler)
    }

    /// Runs the handler on a fixed pool of workers. `workers = 0` uses the
    /// default of five workers per available core.
    pub fn pool(bus: &Arc<MessageBus>, handler: Arc<dyn Handle>, workers: usize) -> Self {
        Self::with_strategy(bus, DispatchStrategy::Pool(workers), handler)
    }

    /// Sets the delivery priority. Higher priorities are delivered first;
    /// the default is 0.
    #[must_use]
    pub fn with_priority(self, priority: i32) -> Self {
        self.core.set_priority(priority);
        self
    }

    /// Name used in logs and activity reports.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Current delivery priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.core.priority()
    }

    /// Messages currently being handled.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.core.active_count()
    }

    /// Messages waiting in the queue.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.core.queue_count()
    }

    /// The bus this dispatcher is bound to.
    #[must_use]
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub(crate) fn core(&self) -> &Arc<DispatchCore> {
        &self.core
    }

    /// Registers the subscription and starts the workers.
    pub fn register(&self, subscription: &Subscription) -> Result<(), BusError> {
        self.bus.register_dispatcher(self, subscription)?;
        self.core.start();
        Ok(())
    }

    /// Like [`Dispatcher::register`], but quietly skips subscriptions whose
    /// message or endpoint is not part of this deployment's topology.
    pub fn register_optional(&self, subscription: &Subscription) -> Result<(), BusError> {
        match self.register(subscription) {
            Ok(()) => Ok(()),
            Err(err @ (BusError::NoSuchMessage { .. } | BusError::NoSuchEndpoint { .. })) => {
                tracing::debug!(dispatcher = %self.core.name(), error = %err, "ignoring optional registration");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Removes the matching registrations. An empty message set in the
    /// subscription removes every registration of this dispatcher.
    ///
    /// Returns whether registrations remain; when none do, the workers are
    /// stopped after draining the queue.
    pub async fn deregister(&self, subscription: &Subscription) -> Result<bool, BusError> {
        let still_registered = self.bus.deregister_dispatcher(self, subscription)?;
        if !still_registered {
            self.core.stop().await;
        }
        Ok(still_registered)
    }

    /// Removes every registration and stops the workers. Safe to call on a
    /// never-registered or already destroyed dispatcher.
    pub async fn destroy(&self) {
        self.bus.remove_dispatcher(self);
        self.core.stop().await;
    }

    /// Starts the workers without registering. Normally [`Dispatcher::register`]
    /// does this.
    pub fn start(&self) {
        self.core.start();
    }

    /// Stops the workers after draining the queue, keeping registrations.
    pub async fn stop(&self) {
        self.core.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::payload;
    use crate::dispatch::handler::HandlerFn;
    use std::time::Duration;
    use tokio::sync::{Barrier, Semaphore};

    fn wired() -> (Arc<MessageBus>, MessageId, EndpointId) {
        let bus = MessageBus::new();
        let message = MessageId::new("PING", "ping");
        let endpoint = EndpointId::new("sut", "system under test");
        bus.define_endpoint(&endpoint).unwrap();
        bus.define_message(&message, &endpoint).unwrap();
        (bus, message, endpoint)
    }

    async fn settle(bus: &Arc<MessageBus>) {
        bus.wait_for_not_active(None, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_callback_runs_inline() {
        let (bus, message, endpoint) = wired();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::callback(
            &bus,
            HandlerFn::arc("inline", move |message: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    if let Some(value) = message.data_as::<u32>() {
                        sink.lock().unwrap().push(*value);
                    }
                    Ok(None)
                }
            }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        bus.trigger_event(&message, &endpoint, None, Some(payload(7u32)))
            .await
            .unwrap();
        // No settling needed: callback handlers complete before the
        // trigger returns.
        assert_eq!(*seen.lock().unwrap(), vec![7]);
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_sequential_preserves_order() {
        let (bus, message, endpoint) = wired();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::sequential(
            &bus,
            HandlerFn::arc("ordered", move |message: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    tokio::task::yield_now().await;
                    if let Some(value) = message.data_as::<u32>() {
                        sink.lock().unwrap().push(*value);
                    }
                    Ok(None)
                }
            }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        for value in 0..10u32 {
            bus.trigger_event(&message, &endpoint, None, Some(payload(value)))
                .await
                .unwrap();
        }
        settle(&bus).await;
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_worker() {
        let (bus, message, endpoint) = wired();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::sequential(
            &bus,
            HandlerFn::arc("flaky", move |message: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    let value = *message.data_as::<u32>().ok_or("missing payload")?;
                    if value % 2 == 1 {
                        return Err(format!("rejecting {value}").into());
                    }
                    sink.lock().unwrap().push(value);
                    Ok(None)
                }
            }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        for value in 0..6u32 {
            bus.trigger_event(&message, &endpoint, None, Some(payload(value)))
                .await
                .unwrap();
        }
        settle(&bus).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 2, 4]);
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_sequential_counts_queue_and_active() {
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

        for _ in 0..3 {
            bus.trigger_event(&message, &endpoint, None, None).await.unwrap();
        }

        // One message occupies the worker, the other two stay queued.
        let mut attempts = 0;
        while !(dispatcher.active_count() == 1 && dispatcher.queue_count() == 2) {
            attempts += 1;
            assert!(attempts < 500, "counters never reached 1 active / 2 queued");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        gate.add_permits(3);
        settle(&bus).await;
        assert_eq!(dispatcher.active_count(), 0);
        assert_eq!(dispatcher.queue_count(), 0);
        dispatcher.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_handles_messages_in_parallel() {
        let (bus, message, endpoint) = wired();
        // Completes only if both handler tasks run at the same time.
        let rendezvous = Arc::new(Barrier::new(2));
        let barrier = Arc::clone(&rendezvous);
        let dispatcher = Dispatcher::concurrent(
            &bus,
            HandlerFn::arc("parallel", move |_message: Message| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok(None)
                }
            }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        bus.trigger_event(&message, &endpoint, None, None).await.unwrap();
        bus.trigger_event(&message, &endpoint, None, None).await.unwrap();
        settle(&bus).await;
        dispatcher.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_runs_up_to_worker_count() {
        let (bus, message, endpoint) = wired();
        let gate = Arc::new(Semaphore::new(0));
        let permits = Arc::clone(&gate);
        let dispatcher = Dispatcher::pool(
            &bus,
            HandlerFn::arc("pooled", move |_message: Message| {
                let permits = Arc::clone(&permits);
                async move {
                    permits.acquire().await?.forget();
                    Ok(None)
                }
            }),
            2,
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();

        for _ in 0..4 {
            bus.trigger_event(&message, &endpoint, None, None).await.unwrap();
        }

        let mut attempts = 0;
        while !(dispatcher.active_count() == 2 && dispatcher.queue_count() == 2) {
            attempts += 1;
            assert!(attempts < 500, "pool never saturated both workers");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        gate.add_permits(4);
        settle(&bus).await;
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (bus, message, endpoint) = wired();
        let dispatcher = Dispatcher::callback(
            &bus,
            HandlerFn::arc("disposable", |_message: Message| async { Ok(None) }),
        );
        dispatcher.register(&Subscription::new([message.clone()])).unwrap();
        assert!(bus.has_registered_dispatchers(&message, &endpoint, None));

        dispatcher.destroy().await;
        assert!(!bus.has_registered_dispatchers(&message, &endpoint, None));
        // A second destroy, and one on a never-registered dispatcher, are
        // both fine.
        dispatcher.destroy().await;
        let fresh = Dispatcher::callback(
            &bus,
            HandlerFn::arc("never-registered", |_message: Message| async { Ok(None) }),
        );
        fresh.destroy().await;
    }

    #[tokio::test]
    async fn test_register_optional_skips_unknown_topology() {
        let (bus, _message, _endpoint) = wired();
        let unknown = MessageId::new("UNKNOWN", "not defined anywhere");
        let dispatcher = Dispatcher::callback(
            &bus,
            HandlerFn::arc("optional", |_message: Message| async { Ok(None) }),
        );

        let err = dispatcher
            .register(&Subscription::new([unknown.clone()]))
            .unwrap_err();
        assert!(matches!(err, BusError::NoSuchMessage { .. }));

        dispatcher
            .register_optional(&Subscription::new([unknown]))
            .unwrap();
        assert!(!bus.dispatcher_is_registered(&dispatcher));
    }

    #[tokio::test]
    async fn test_reregister_restarts_workers() {
        let (bus, message, endpoint) = wired();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::sequential(
            &bus,
            HandlerFn::arc("revived", move |message: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    if let Some(value) = message.data_as::<u32>() {
                        sink.lock().unwrap().push(*value);
                    }
                    Ok(None)
                }
            }),
        );
        let subscription = Subscription::new([message.clone()]);

        dispatcher.register(&subscription).unwrap();
        bus.trigger_event(&message, &endpoint, None, Some(payload(1u32)))
            .await
            .unwrap();
        settle(&bus).await;

        let still = dispatcher.deregister(&subscription).await.unwrap();
        assert!(!still);

        dispatcher.register(&subscription).unwrap();
        bus.trigger_event(&message, &endpoint, None, Some(payload(2u32)))
            .await
            .unwrap();
        settle(&bus).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        dispatcher.destroy().await;
    }

    #[tokio::test]
    async fn test_deregister_drains_queued_work_before_stopping() {
        let (bus, message, endpoint) = wired();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let dispatcher = Dispatcher::sequential(
            &bus,
            HandlerFn::arc("draining", move |message: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if let Some(value) = message.data_as::<u32>() {
                        sink.lock().unwrap().push(*value);
                    }
                    Ok(None)
                }
            }),
        );
        let subscription = Subscription::new([message.clone()]);
        dispatcher.register(&subscription).unwrap();

        for value in 0..5u32 {
            bus.trigger_event(&message, &endpoint, None, Some(payload(value)))
                .await
                .unwrap();
        }

        // Deregistering awaits the worker, which finishes the queue first.
        let still = dispatcher.deregister(&subscription).await.unwrap();
        assert!(!still);
        assert_eq!(*seen.lock().unwrap(), (0..5).collect::<Vec<_>>());
        assert_eq!(dispatcher.active_count(), 0);
        assert_eq!(dispatcher.queue_count(), 0);
    }
}
