//! # Local message queue: pull-style consumption of bus messages.
//!
//! Wraps a callback [`Dispatcher`] that pushes every delivered message into
//! an in-process FIFO queue, for consumers that want to `get` messages at
//! their own pace instead of handling them in a callback.
//!
//! ## Rules
//! - Only messages delivered after [`LocalMessageQueue::subscribe`] are
//!   queued.
//! - [`LocalMessageQueue::unblock`] enqueues a marker in FIFO position; the
//!   `get` that reaches it fails with [`QueueError::Unblocked`] while
//!   earlier and later messages are unaffected.

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::bus::{Message, MessageBus};
use crate::dispatch::dispatcher::{Dispatcher, Subscription};
use crate::dispatch::handler::{Handle, HandlerFn, MessageFilter};
use crate::error::{BusError, QueueError};

/// A subscription whose messages are consumed with `get` calls.
pub struct LocalMessageQueue {
    dispatcher: Dispatcher,
    tx: mpsc::UnboundedSender<Option<Message>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Option<Message>>>,
    count: Arc<AtomicUsize>,
}

impl LocalMessageQueue {
    /// Subscribes a queue to the bus. Messages matching the subscription
    /// are queued from this point on.
    pub fn subscribe(
        bus: &Arc<MessageBus>,
        subscription: &Subscription,
    ) -> Result<Arc<Self>, BusError> {
        Self::build(bus, subscription, None)
    }

    /// Like [`LocalMessageQueue::subscribe`], but only queues messages for
    /// which the predicate returns `true`.
    pub fn subscribe_filtered(
        bus: &Arc<MessageBus>,
        subscription: &Subscription,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Result<Arc<Self>, BusError> {
        Self::build(bus, subscription, Some(Box::new(predicate)))
    }

    fn build(
        bus: &Arc<MessageBus>,
        subscription: &Subscription,
        predicate: Option<Box<dyn Fn(&Message) -> bool + Send + Sync>>,
    ) -> Result<Arc<Self>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));

        let sender = tx.clone();
        let pending = Arc::clone(&count);
        let handler: Arc<dyn Handle> = HandlerFn::arc("local-queue", move |message: Message| {
            let sender = sender.clone();
            let pending = Arc::clone(&pending);
            async move {
                pending.fetch_add(1, AtomicOrdering::SeqCst);
                if sender.send(Some(message)).is_err() {
                    pending.fetch_sub(1, AtomicOrdering::SeqCst);
                }
                Ok(None)
            }
        });
        let handler: Arc<dyn Handle> = match predicate {
            Some(predicate) => MessageFilter::arc(handler, predicate),
            None => handler,
        };

        let queue = Arc::new(LocalMessageQueue {
            dispatcher: Dispatcher::callback(bus, handler),
            tx,
            rx: AsyncMutex::new(rx),
            count,
        });
        queue.dispatcher.register(subscription)?;
        Ok(queue)
    }

    /// Waits for the next queued message.
    pub async fn get(&self) -> Result<Message, QueueError> {
        let received = { self.rx.lock().await.recv().await };
        match received {
            Some(Some(message)) => {
                self.count.fetch_sub(1, AtomicOrdering::SeqCst);
                Ok(message)
            }
            Some(None) => {
                self.count.fetch_sub(1, AtomicOrdering::SeqCst);
                Err(QueueError::Unblocked)
            }
            None => Err(QueueError::Closed),
        }
    }

    /// Waits up to `timeout` for the next queued message.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Message, QueueError> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Empty { timeout }),
        }
    }

    /// Wakes up one pending or future `get` with [`QueueError::Unblocked`].
    ///
    /// The marker takes a FIFO slot: messages queued before it are still
    /// returned first.
    pub fn unblock(&self) {
        self.count.fetch_add(1, AtomicOrdering::SeqCst);
        if self.tx.send(None).is_err() {
            self.count.fetch_sub(1, AtomicOrdering::SeqCst);
        }
    }

    /// Whether the queue holds nothing, counting unblock markers.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.count.load(AtomicOrdering::SeqCst) == 0
    }

    /// Removes the subscription. Already queued messages stay readable.
    pub async fn unsubscribe(&self) {
        self.dispatcher.destroy().await;
    }
}
