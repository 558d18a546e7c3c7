//! # Endpoint and message identities.
//!
//! [`EndpointId`] and [`MessageId`] are handles with identity semantics:
//! every call to `new` produces a distinct id, even for the same name. Two
//! clones of one id compare equal; two ids created from the same arguments do
//! not. Names exist for logs and reports only and carry no uniqueness
//! guarantee.
//!
//! ## Rules
//! - Equality and hashing use the allocation sequence number, never the name.
//! - Clones are cheap (`Arc` bump) and share the same identity.
//! - Descriptions are dedented and trimmed so indented literals read clean.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Global allocation counter giving each id its identity.
static ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct IdInner {
    seq: u64,
    name: Arc<str>,
    description: Arc<str>,
}

impl IdInner {
    fn new(name: impl Into<Arc<str>>, description: &str) -> Arc<Self> {
        Arc::new(IdInner {
            seq: ID_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            name: name.into(),
            description: dedent(description).into(),
        })
    }
}

/// Strips common leading whitespace and surrounding blank lines, so
/// descriptions written as indented multi-line literals come out flush.
fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str(line.get(indent..).unwrap_or_else(|| line.trim_start()));
            out.push('\n');
        }
    }
    out.trim().to_string()
}

/// Identity of a message sender or receiver in the bus topology.
///
/// # Example
/// ```
/// use testrig::EndpointId;
///
/// let sut = EndpointId::new("sut", "The system under test");
/// let other = EndpointId::new("sut", "The system under test");
///
/// assert_eq!(sut, sut.clone());
/// assert_ne!(sut, other);
/// ```
#[derive(Clone, Debug)]
pub struct EndpointId {
    inner: Arc<IdInner>,
}

impl EndpointId {
    /// Creates a new endpoint identity.
    pub fn new(name: impl Into<Arc<str>>, description: &str) -> Self {
        EndpointId {
            inner: IdInner::new(name, description),
        }
    }

    /// Display name of the endpoint.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.inner.name
    }

    /// Normalized description of the endpoint.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.inner.description
    }
}

impl PartialEq for EndpointId {
    fn eq(&self, other: &Self) -> bool {
        self.inner.seq == other.inner.seq
    }
}

impl Eq for EndpointId {}

impl Hash for EndpointId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.seq.hash(state);
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}

/// Identity of a message type in the bus topology.
///
/// Like [`EndpointId`], equality is by identity: defining "the same" message
/// twice produces two unrelated messages.
#[derive(Clone, Debug)]
pub struct MessageId {
    inner: Arc<IdInner>,
}

impl MessageId {
    /// Creates a new message identity.
    pub fn new(name: impl Into<Arc<str>>, description: &str) -> Self {
        MessageId {
            inner: IdInner::new(name, description),
        }
    }

    /// Display name of the message.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.inner.name
    }

    /// Normalized description of the message.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.inner.description
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.inner.seq == other.inner.seq
    }
}

impl Eq for MessageId {}

impl Hash for MessageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.seq.hash(state);
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.name)
    }
}
