//! Error types used by the message bus, dispatchers, and the test runner.
//!
//! This module defines the error enums for each layer of the crate:
//!
//! - [`BusError`] — errors raised by topology definition and dispatcher registration.
//! - [`DispatchError`] — errors produced while delivering a single message to a handler.
//! - [`QueueError`] — errors raised by [`LocalMessageQueue`](crate::dispatch::LocalMessageQueue) receives.
//! - [`RunnerError`] — errors raised by the test runner control loop.
//! - [`TestFailure`] — the outcome of a single test case, mapped to a verdict.
//!
//! All types provide an `as_label` helper returning a short stable snake_case
//! name for use in logs.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

fn for_message(message: &Option<Arc<str>>) -> String {
    match message {
        Some(message) => format!(" for message '{message}'"),
        None => String::new(),
    }
}

/// # Errors produced by the message bus.
///
/// These cover topology definition (endpoints and messages), dispatcher
/// registration bookkeeping, and activity waiting.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// The endpoint is already part of the topology, either globally or for a
    /// specific message.
    #[error("endpoint '{endpoint}' already defined{}", for_message(.message))]
    EndpointAlreadyDefined {
        /// Name of the endpoint that was defined twice.
        endpoint: Arc<str>,
        /// Message the endpoint was being attached to, if any.
        message: Option<Arc<str>>,
    },

    /// The endpoint is not part of the topology, or not attached to the named message.
    #[error("no such endpoint '{endpoint}'{}", for_message(.message))]
    NoSuchEndpoint {
        /// Name of the unknown endpoint.
        endpoint: Arc<str>,
        /// Message the endpoint was expected on, if the operation was message-scoped.
        message: Option<Arc<str>>,
    },

    /// The message is not part of the topology.
    #[error("no such message '{message}'")]
    NoSuchMessage {
        /// Name of the unknown message.
        message: Arc<str>,
    },

    /// Deregistration did not match any registered dispatcher.
    #[error("no such dispatcher '{dispatcher}'")]
    NoSuchDispatcher {
        /// Name of the dispatcher that had no matching registration.
        dispatcher: Arc<str>,
    },

    /// A registration was attempted with an empty message set.
    #[error("at least one message id is required to register a dispatcher")]
    MessagesRequired,

    /// Bus activity did not drain within the allowed time.
    ///
    /// The report lists every endpoint that still had queued or active
    /// dispatchers when the wait gave up.
    #[error("Waiting for MessageBus activity to stop timed out:\n{report}")]
    Timeout {
        /// Rendered per-endpoint activity report.
        report: Arc<str>,
    },
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use testrig::BusError;
    ///
    /// let err = BusError::MessagesRequired;
    /// assert_eq!(err.as_label(), "bus_messages_required");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::EndpointAlreadyDefined { .. } => "bus_endpoint_already_defined",
            BusError::NoSuchEndpoint { .. } => "bus_no_such_endpoint",
            BusError::NoSuchMessage { .. } => "bus_no_such_message",
            BusError::NoSuchDispatcher { .. } => "bus_no_such_dispatcher",
            BusError::MessagesRequired => "bus_messages_required",
            BusError::Timeout { .. } => "bus_timeout",
        }
    }
}

/// # Errors produced while delivering one message to one handler.
///
/// A failed delivery never affects other dispatchers of the same message;
/// the error is routed into the reply slot when the message is a request.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The handler returned an error.
    #[error("handler failed: {error}")]
    Failed {
        /// Rendered handler error message.
        error: Arc<str>,
    },

    /// The handler panicked; the panic was caught at the dispatch boundary.
    #[error("handler panicked: {error}")]
    Panicked {
        /// Rendered panic payload.
        error: Arc<str>,
    },

    /// Waiting for the reply exceeded the allowed time.
    #[error("no reply within {timeout:?}")]
    Timeout {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The reply can never arrive: the dispatcher was destroyed or dropped
    /// the slot without resolving it.
    #[error("reply canceled")]
    Canceled,
}

impl DispatchError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::Failed { .. } => "dispatch_failed",
            DispatchError::Panicked { .. } => "dispatch_panicked",
            DispatchError::Timeout { .. } => "dispatch_timeout",
            DispatchError::Canceled => "dispatch_canceled",
        }
    }
}

/// # Errors produced by [`LocalMessageQueue`](crate::dispatch::LocalMessageQueue) receives.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum QueueError {
    /// No message arrived within the allowed time.
    #[error("no message within {timeout:?}")]
    Empty {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// The queue was unblocked before receiving the next message.
    #[error("queue was unblocked before receiving next message")]
    Unblocked,

    /// The queue's dispatcher is gone and no further messages can arrive.
    #[error("queue closed")]
    Closed,
}

impl QueueError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            QueueError::Empty { .. } => "queue_empty",
            QueueError::Unblocked => "queue_unblocked",
            QueueError::Closed => "queue_closed",
        }
    }
}

/// # Errors produced by the test runner control loop.
///
/// These are fatal for the run: the control loop stops processing commands
/// and `run` returns the error.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The execution gate stayed closed longer than the configured limit.
    #[error("execution paused for longer than {timeout:?}")]
    ExecutionPausedTooLong {
        /// The pause limit that was exceeded.
        timeout: Duration,
    },

    /// No command arrived on the control queue within the configured limit.
    #[error("no runner command within {timeout:?}")]
    CommandQueueStalled {
        /// The command wait limit that was exceeded.
        timeout: Duration,
    },

    /// `run` was called while a previous run was still in progress.
    #[error("a test run is already in progress")]
    AlreadyRunning,

    /// The scheduling request could not be answered.
    #[error("scheduler unavailable: {reason}")]
    SchedulerUnavailable {
        /// Why no next test case could be obtained.
        reason: Arc<str>,
    },

    /// A scheduling reply carried data of an unexpected type.
    #[error("unexpected scheduling reply payload")]
    UnexpectedReply,

    /// A bus operation failed while driving the run.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl RunnerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunnerError::ExecutionPausedTooLong { .. } => "runner_paused_too_long",
            RunnerError::CommandQueueStalled { .. } => "runner_command_queue_stalled",
            RunnerError::AlreadyRunning => "runner_already_running",
            RunnerError::SchedulerUnavailable { .. } => "runner_scheduler_unavailable",
            RunnerError::UnexpectedReply => "runner_unexpected_reply",
            RunnerError::Bus(_) => "runner_bus",
        }
    }
}

/// # Outcome of a single test case execution.
///
/// Each variant maps to a [`Verdict`](crate::runner::Verdict): assertion
/// failures become `Failed`, skips become `Skipped`, disabled tests become
/// `Ignored`, and aborts and plain errors become `Error`.
///
/// `Skip` and `Error` may carry a cause, preserving the chain of failures
/// that led to the outcome (for example a scope teardown error behind a
/// preparation skip).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum TestFailure {
    /// An assertion did not hold.
    #[error("{message}")]
    Assertion {
        /// Rendered assertion message.
        message: Arc<str>,
    },

    /// The test was skipped before or during execution.
    #[error("{reason}")]
    Skip {
        /// Why the test was skipped.
        reason: Arc<str>,
        /// The failure that caused the skip, if any.
        #[source]
        cause: Option<Box<TestFailure>>,
    },

    /// The test is disabled by its definition and was never executed.
    #[error("{reason}")]
    Disabled {
        /// Why the test is disabled.
        reason: Arc<str>,
    },

    /// The test was aborted while running.
    #[error("{reason}")]
    Aborted {
        /// Why the test was aborted.
        reason: Arc<str>,
    },

    /// The test raised an error that is not an assertion failure.
    #[error("{error}")]
    Error {
        /// Rendered error message.
        error: Arc<str>,
        /// The failure that caused this error, if any.
        #[source]
        cause: Option<Box<TestFailure>>,
    },
}

impl TestFailure {
    /// Creates an assertion failure.
    #[inline]
    pub fn assertion(message: impl Into<Arc<str>>) -> Self {
        TestFailure::Assertion {
            message: message.into(),
        }
    }

    /// Creates a skip without a cause.
    #[inline]
    pub fn skip(reason: impl Into<Arc<str>>) -> Self {
        TestFailure::Skip {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Creates a skip caused by another failure.
    #[inline]
    pub fn skip_caused_by(reason: impl Into<Arc<str>>, cause: TestFailure) -> Self {
        TestFailure::Skip {
            reason: reason.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Creates a disabled outcome.
    #[inline]
    pub fn disabled(reason: impl Into<Arc<str>>) -> Self {
        TestFailure::Disabled {
            reason: reason.into(),
        }
    }

    /// Creates an aborted outcome.
    #[inline]
    pub fn aborted(reason: impl Into<Arc<str>>) -> Self {
        TestFailure::Aborted {
            reason: reason.into(),
        }
    }

    /// Creates a plain error without a cause.
    #[inline]
    pub fn error(error: impl Into<Arc<str>>) -> Self {
        TestFailure::Error {
            error: error.into(),
            cause: None,
        }
    }

    /// Creates a plain error caused by another failure.
    #[inline]
    pub fn error_caused_by(error: impl Into<Arc<str>>, cause: TestFailure) -> Self {
        TestFailure::Error {
            error: error.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Returns the failure that caused this one, if any.
    pub fn cause(&self) -> Option<&TestFailure> {
        match self {
            TestFailure::Skip { cause, .. } | TestFailure::Error { cause, .. } => cause.as_deref(),
            _ => None,
        }
    }

    /// Walks this failure and its cause chain looking for a skip.
    ///
    /// A failure whose root cause was a skip is reported as skipped rather
    /// than failed, so the verdict reflects the missing precondition instead
    /// of whatever error it was wrapped in.
    ///
    /// # Example
    /// ```
    /// use testrig::TestFailure;
    ///
    /// let failure = TestFailure::error_caused_by(
    ///     "fixture not available",
    ///     TestFailure::skip("requires hardware"),
    /// );
    /// assert!(failure.find_skip().is_some());
    /// assert!(TestFailure::assertion("1 != 2").find_skip().is_none());
    /// ```
    pub fn find_skip(&self) -> Option<&TestFailure> {
        let mut current = Some(self);
        while let Some(failure) = current {
            if matches!(failure, TestFailure::Skip { .. }) {
                return Some(failure);
            }
            current = failure.cause();
        }
        None
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TestFailure::Assertion { .. } => "test_assertion",
            TestFailure::Skip { .. } => "test_skip",
            TestFailure::Disabled { .. } => "test_disabled",
            TestFailure::Aborted { .. } => "test_aborted",
            TestFailure::Error { .. } => "test_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_such_endpoint_display_with_and_without_message() {
        let bare = BusError::NoSuchEndpoint {
            endpoint: "sut".into(),
            message: None,
        };
        assert_eq!(bare.to_string(), "no such endpoint 'sut'");

        let scoped = BusError::NoSuchEndpoint {
            endpoint: "sut".into(),
            message: Some("POWER_ON".into()),
        };
        assert_eq!(
            scoped.to_string(),
            "no such endpoint 'sut' for message 'POWER_ON'"
        );
    }

    #[test]
    fn test_timeout_report_is_embedded_verbatim() {
        let err = BusError::Timeout {
            report: "  sut:\n    slow: queue_count=3, active_count=1".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("Waiting for MessageBus activity to stop timed out:\n"));
        assert!(rendered.contains("slow: queue_count=3, active_count=1"));
    }

    #[test]
    fn test_find_skip_walks_cause_chain() {
        let chained = TestFailure::error_caused_by(
            "teardown exploded",
            TestFailure::skip_caused_by("preparation failed", TestFailure::assertion("boom")),
        );
        let skip = chained.find_skip().unwrap();
        assert_eq!(skip.to_string(), "preparation failed");

        let no_skip = TestFailure::error_caused_by("outer", TestFailure::assertion("inner"));
        assert!(no_skip.find_skip().is_none());
    }

    #[test]
    fn test_failure_labels_are_stable() {
        assert_eq!(TestFailure::assertion("x").as_label(), "test_assertion");
        assert_eq!(TestFailure::skip("x").as_label(), "test_skip");
        assert_eq!(TestFailure::disabled("x").as_label(), "test_disabled");
        assert_eq!(TestFailure::aborted("x").as_label(), "test_aborted");
        assert_eq!(TestFailure::error("x").as_label(), "test_error");
    }

    #[test]
    fn test_runner_error_wraps_bus_error() {
        let err = RunnerError::from(BusError::NoSuchMessage {
            message: "RUN".into(),
        });
        assert_eq!(err.as_label(), "runner_bus");
        assert_eq!(err.to_string(), "no such message 'RUN'");
    }
}
