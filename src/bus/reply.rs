//! # Reply plumbing for requests.
//!
//! Every matched registration of a request gets a one-shot reply pair: the
//! dispatcher side resolves a [`ReplySlot`] with the handler outcome, the
//! caller side awaits the [`Reply`]. [`Replies`] is the collection
//! `send_request` returns, in delivery (descending priority) order.
//!
//! ## Rules
//! - A slot dropped unresolved yields [`DispatchError::Canceled`] on the
//!   caller side; a reply is never silently lost.
//! - With a callback dispatcher the reply may already be resolved when
//!   `send_request` returns; awaiting it then completes immediately.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;

use crate::bus::message::Payload;
use crate::error::DispatchError;

/// Outcome of one handler invocation: an optional reply value or the
/// delivery failure.
pub type DispatchResult = Result<Option<Payload>, DispatchError>;

/// Dispatcher-side half of a reply pair.
#[derive(Debug)]
pub struct ReplySlot {
    tx: oneshot::Sender<DispatchResult>,
}

impl ReplySlot {
    /// Resolves the reply. The caller may have given up already; that is
    /// not an error for the dispatcher.
    pub(crate) fn resolve(self, result: DispatchResult) {
        let _ = self.tx.send(result);
    }
}

/// Caller-side half of a reply pair.
#[derive(Debug)]
pub struct Reply {
    dispatcher: Arc<str>,
    rx: oneshot::Receiver<DispatchResult>,
}

impl Reply {
    /// Name of the dispatcher this reply will come from.
    #[must_use]
    pub fn dispatcher(&self) -> &str {
        &self.dispatcher
    }

    /// Waits for the reply.
    pub async fn recv(self) -> DispatchResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Canceled),
        }
    }

    /// Waits for the reply, giving up after `timeout`.
    pub async fn recv_timeout(self, timeout: Duration) -> DispatchResult {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::Canceled),
            Err(_) => Err(DispatchError::Timeout { timeout }),
        }
    }
}

/// Creates a reply pair for one delivery.
pub(crate) fn reply_channel(dispatcher: Arc<str>) -> (ReplySlot, Reply) {
    let (tx, rx) = oneshot::channel();
    (ReplySlot { tx }, Reply { dispatcher, rx })
}

/// All replies of one `send_request`, in delivery order.
#[derive(Debug, Default)]
pub struct Replies {
    replies: Vec<Reply>,
}

impl Replies {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Replies { replies }
    }

    /// Number of dispatchers the request was delivered to.
    #[must_use]
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    /// True when the request matched no registration.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    /// Waits for every reply concurrently, giving each up to `timeout`.
    ///
    /// Results come back in delivery order, independent of which handler
    /// finished first.
    pub async fn wait_all(self, timeout: Duration) -> Vec<DispatchResult> {
        join_all(
            self.replies
                .into_iter()
                .map(|reply| reply.recv_timeout(timeout)),
        )
        .await
    }
}

impl IntoIterator for Replies {
    type Item = Reply;
    type IntoIter = std::vec::IntoIter<Reply>;

    fn into_iter(self) -> Self::IntoIter {
        self.replies.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::payload;

    #[tokio::test]
    async fn test_resolved_slot_delivers_result() {
        let (slot, reply) = reply_channel("worker".into());
        assert_eq!(reply.dispatcher(), "worker");

        slot.resolve(Ok(Some(payload(7u32))));
        let result = reply.recv().await.unwrap();
        assert_eq!(result.unwrap().downcast_ref::<u32>(), Some(&7));
    }

    #[tokio::test]
    async fn test_dropped_slot_is_canceled() {
        let (slot, reply) = reply_channel("worker".into());
        drop(slot);
        assert!(matches!(reply.recv().await, Err(DispatchError::Canceled)));
    }

    #[tokio::test]
    async fn test_recv_timeout_elapses() {
        let (_slot, reply) = reply_channel("worker".into());
        let result = reply.recv_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DispatchError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_all_preserves_delivery_order() {
        let (slot_a, reply_a) = reply_channel("a".into());
        let (slot_b, reply_b) = reply_channel("b".into());
        let replies = Replies::new(vec![reply_a, reply_b]);
        assert_eq!(replies.len(), 2);

        // Resolve in reverse order; results must still come back as a, b.
        slot_b.resolve(Ok(Some(payload(2u32))));
        slot_a.resolve(Ok(Some(payload(1u32))));

        let results = replies.wait_all(Duration::from_secs(1)).await;
        let values: Vec<u32> = results
            .into_iter()
            .map(|r| *r.unwrap().unwrap().downcast_ref::<u32>().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_empty_replies() {
        let replies = Replies::default();
        assert!(replies.is_empty());
        assert!(replies.wait_all(Duration::from_millis(1)).await.is_empty());
    }
}
