//! # The message delivered to dispatchers.
//!
//! A [`Message`] is built by the bus for every matched registration and
//! handed to the dispatcher. The payload is a shared [`Payload`] so a single
//! trigger fans out to any number of dispatchers without copying the data.
//!
//! ## Rules
//! - `endpoint` is the sender for events and the addressed receiver for
//!   requests (`None` when the request went to all endpoints).
//! - `entity` is the triggering entity when one was given, otherwise the
//!   entity of the registration the message matched (`None` for wildcard).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::bus::id::{EndpointId, MessageId};

/// Shared, type-erased message data.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wraps a value as a [`Payload`].
///
/// # Example
/// ```
/// use testrig::payload;
///
/// let data = payload(42u32);
/// assert_eq!(data.downcast_ref::<u32>(), Some(&42));
/// ```
#[inline]
pub fn payload<T: Any + Send + Sync>(value: T) -> Payload {
    Arc::new(value)
}

/// One delivery of a message to one dispatcher.
#[derive(Clone)]
pub struct Message {
    id: MessageId,
    endpoint: Option<EndpointId>,
    entity: Option<Arc<str>>,
    data: Option<Payload>,
}

impl Message {
    pub(crate) fn new(
        id: MessageId,
        endpoint: Option<EndpointId>,
        entity: Option<Arc<str>>,
        data: Option<Payload>,
    ) -> Self {
        Message {
            id,
            endpoint,
            entity,
            data,
        }
    }

    /// The message identity this delivery belongs to.
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Sender endpoint for events, addressed receiver for requests.
    #[must_use]
    pub fn endpoint(&self) -> Option<&EndpointId> {
        self.endpoint.as_ref()
    }

    /// Entity this delivery is for, if any.
    #[must_use]
    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    /// Raw payload, if any.
    #[must_use]
    pub fn data(&self) -> Option<&Payload> {
        self.data.as_ref()
    }

    /// Payload downcast to a concrete type.
    ///
    /// Returns `None` when there is no payload or the type does not match.
    #[must_use]
    pub fn data_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|data| data.downcast_ref::<T>())
    }

    /// Owned payload handle, for handlers that outlive the message.
    #[must_use]
    pub fn data_owned(&self) -> Option<Payload> {
        self.data.clone()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id.name())
            .field("endpoint", &self.endpoint.as_ref().map(|e| e.name()))
            .field("entity", &self.entity)
            .field("data", &self.data.as_ref().map(|_| "..."))
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_as_matches_payload_type() {
        let id = MessageId::new("REPORT", "report");
        let endpoint = EndpointId::new("sut", "sut");
        let message = Message::new(
            id.clone(),
            Some(endpoint),
            Some("db".into()),
            Some(payload(String::from("ready"))),
        );

        assert_eq!(message.id(), &id);
        assert_eq!(message.entity(), Some("db"));
        assert_eq!(message.data_as::<String>().map(String::as_str), Some("ready"));
        assert!(message.data_as::<u32>().is_none());
    }

    #[test]
    fn test_message_without_data() {
        let id = MessageId::new("PING", "ping");
        let message = Message::new(id, None, None, None);
        assert!(message.endpoint().is_none());
        assert!(message.entity().is_none());
        assert!(message.data().is_none());
        assert!(message.data_as::<String>().is_none());
    }

    #[test]
    fn test_display_is_message_name() {
        let id = MessageId::new("PING", "ping");
        let message = Message::new(id, None, None, None);
        assert_eq!(message.to_string(), "PING");
    }
}
