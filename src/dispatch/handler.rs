//! # Handler contract and adapters.
//!
//! A [`Handle`] receives the messages its dispatcher is registered for and
//! optionally produces a reply value. [`HandlerFn`] adapts a plain async
//! closure; [`MessageFilter`] gates another handler behind a predicate.
//!
//! ## Rules
//! - Handlers run inside the dispatch boundary: errors and panics are
//!   caught there, logged, and routed into the reply slot for requests.
//! - The returned value only reaches a caller when the message was sent
//!   as a request; for events it is discarded.

use std::any::Any;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Message, Payload};

/// Boxed error type handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler produces: an optional reply value or an error.
pub type HandlerResult = Result<Option<Payload>, BoxError>;

/// A message handler bound to a dispatcher.
#[async_trait]
pub trait Handle: Send + Sync + 'static {
    /// Handles one delivered message.
    async fn on_message(&self, message: Message) -> HandlerResult;

    /// Name used in logs and activity reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter turning an async closure into a [`Handle`].
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use testrig::{BoxError, Handle, HandlerFn, Message};
///
/// let echo: Arc<dyn Handle> = HandlerFn::arc("echo", |message: Message| async move {
///     Ok::<_, BoxError>(message.data_owned())
/// });
/// assert_eq!(echo.name(), "echo");
/// ```
pub struct HandlerFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> HandlerFn<F> {
    /// Creates a named handler from a closure.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        HandlerFn {
            name: name.into(),
            f,
        }
    }

    /// Creates a named handler wrapped in an [`Arc`].
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> Handle for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn on_message(&self, message: Message) -> HandlerResult {
        (self.f)(message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Gates an inner handler behind a message predicate.
///
/// Messages failing the predicate resolve to `Ok(None)` without reaching
/// the inner handler, so filtered requests reply with no data instead of
/// hanging.
pub struct MessageFilter {
    inner: Arc<dyn Handle>,
    predicate: Box<dyn Fn(&Message) -> bool + Send + Sync>,
}

impl MessageFilter {
    /// Wraps `inner` so it only sees messages matching `predicate`.
    pub fn new(
        inner: Arc<dyn Handle>,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        MessageFilter {
            inner,
            predicate: Box::new(predicate),
        }
    }

    /// Like [`MessageFilter::new`] but wrapped in an [`Arc`].
    pub fn arc(
        inner: Arc<dyn Handle>,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::new(inner, predicate))
    }
}

#[async_trait]
impl Handle for MessageFilter {
    async fn on_message(&self, message: Message) -> HandlerResult {
        if (self.predicate)(&message) {
            self.inner.on_message(message).await
        } else {
            Ok(None)
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Renders a caught panic payload for logs and dispatch errors.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{payload, MessageId};

    fn message_with(entity: Option<&str>) -> Message {
        Message::new(
            MessageId::new("PING", "ping"),
            None,
            entity.map(Into::into),
            Some(payload(1u32)),
        )
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = HandlerFn::arc("echo", |message: Message| async move {
            Ok(message.data_owned())
        });
        assert_eq!(handler.name(), "echo");

        let result = handler.on_message(message_with(None)).await.unwrap();
        assert_eq!(result.unwrap().downcast_ref::<u32>(), Some(&1));
    }

    #[tokio::test]
    async fn test_filter_blocks_unmatched_messages() {
        let inner = HandlerFn::arc("picky", |message: Message| async move {
            Ok(message.data_owned())
        });
        let filtered = MessageFilter::arc(inner, |message| message.entity() == Some("db"));

        let blocked = filtered.on_message(message_with(None)).await.unwrap();
        assert!(blocked.is_none());

        let passed = filtered.on_message(message_with(Some("db"))).await.unwrap();
        assert!(passed.is_some());
        assert_eq!(filtered.name(), "picky");
    }

    #[test]
    fn test_panic_message_rendering() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "non-string panic payload");
    }
}
