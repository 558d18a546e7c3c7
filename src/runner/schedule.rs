//! # The scheduling protocol between the runner and a scheduler.
//!
//! The runner does not own a test queue. Whenever a worker slot is free it
//! sends [`SCHEDULE_NEXT_TEST`] to [`SCHEDULER_ENDPOINT`] and runs whatever
//! definition comes back. Any component that registers for that message can
//! act as the scheduler; the crate ships one behind the `scheduler` feature.
//!
//! ## Rules
//! - The reply to [`SCHEDULE_NEXT_TEST`] carries an `Arc<TestDefinition>`,
//!   or no data once the queue is exhausted.
//! - Queue manipulation messages carry `Vec<TestDefinition>` payloads.
//! - [`TestDefinition`] equality is by name and parameters; the body is
//!   ignored, so rebuilding a definition still matches for removal.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::bus::{EndpointId, MessageBus, MessageId};
use crate::error::BusError;
use crate::runner::testcase::{TestFn, TestParam};

/// The endpoint scheduling requests are addressed to.
pub static SCHEDULER_ENDPOINT: LazyLock<EndpointId> = LazyLock::new(|| {
    EndpointId::new(
        "scheduler",
        "
        Decides which test case runs next.

        Hands out test definitions one at a time and allows the queue to
        be inspected and modified while the run is in progress.
        ",
    )
});

/// Request for the next test definition. Reply data: `Arc<TestDefinition>`,
/// or no data when the queue is exhausted.
pub static SCHEDULE_NEXT_TEST: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "SCHEDULE_NEXT_TEST",
        "
        Requests the next test case to execute.

        The reply carries the scheduled definition, or no data once the
        run queue is exhausted.
        ",
    )
});

/// Request to append definitions to the queue.
/// Payload: `Vec<TestDefinition>`.
pub static ADD_TEST_CASES: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "ADD_TEST_CASES",
        "Requests that test cases are appended to the run queue.",
    )
});

/// Request to remove definitions from the queue.
/// Payload: `Vec<TestDefinition>`; reply data: removed `Vec<TestDefinition>`.
pub static REMOVE_TEST_CASES: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "REMOVE_TEST_CASES",
        "
        Requests that matching test cases are removed from the run queue.

        All queued occurrences of each given definition are removed. The
        reply carries the definitions that were actually removed.
        ",
    )
});

/// Request to drain the queue. Reply data: drained `Vec<TestDefinition>`.
pub static CLEAR_RUN_QUEUE: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "CLEAR_RUN_QUEUE",
        "Requests that the run queue is emptied, replying with its contents.",
    )
});

/// Request for a copy of the queue. Reply data: `Vec<TestDefinition>`.
pub static GET_CURRENT_RUN_QUEUE: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "GET_CURRENT_RUN_QUEUE",
        "Requests a snapshot of the current run queue.",
    )
});

/// Request for the definition handed out last. Reply data:
/// `Arc<TestDefinition>`, or no data when nothing was scheduled yet.
pub static GET_LAST_SCHEDULED_TEST: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "GET_LAST_SCHEDULED_TEST",
        "Requests the test case definition that was scheduled last.",
    )
});

/// Event sent right before the scheduler picks the next test case.
pub static SCHEDULING_NEXT_TEST: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "SCHEDULING_NEXT_TEST",
        "
        Sent before the next test case is picked from the run queue.

        Subscribers may still modify the queue at this point and affect
        what is scheduled.
        ",
    )
});

/// Event sent the first time the scheduler builds its queue.
/// Payload: `Vec<TestDefinition>`.
pub static RUN_QUEUE_INITIALIZED: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "RUN_QUEUE_INITIALIZED",
        "Sent when the run queue has been created, with its initial contents.",
    )
});

/// Event sent after the queue was changed.
/// Payload: `Vec<TestDefinition>`.
pub static RUN_QUEUE_MODIFIED: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "RUN_QUEUE_MODIFIED",
        "Sent when the run queue has been modified, with its new contents.",
    )
});

/// Event sent when a scheduling request finds the queue empty.
pub static RUN_QUEUE_EMPTY: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "RUN_QUEUE_EMPTY",
        "
        Sent when the run queue is empty while the next test case is
        being scheduled.

        Subscribers may react by refilling the queue; the scheduler checks
        it once more before reporting exhaustion.
        ",
    )
});

/// Defines the scheduler endpoint and all of its messages on `bus`.
///
/// # Errors
/// Fails when the endpoint or one of the messages is already defined.
pub fn define_scheduler_topology(bus: &MessageBus) -> Result<(), BusError> {
    bus.define_endpoints_and_messages([(
        SCHEDULER_ENDPOINT.clone(),
        vec![
            SCHEDULE_NEXT_TEST.clone(),
            ADD_TEST_CASES.clone(),
            REMOVE_TEST_CASES.clone(),
            CLEAR_RUN_QUEUE.clone(),
            GET_CURRENT_RUN_QUEUE.clone(),
            GET_LAST_SCHEDULED_TEST.clone(),
            SCHEDULING_NEXT_TEST.clone(),
            RUN_QUEUE_INITIALIZED.clone(),
            RUN_QUEUE_MODIFIED.clone(),
            RUN_QUEUE_EMPTY.clone(),
        ],
    )])
}

/// A schedulable test case.
///
/// Definitions are what the scheduler queues and hands out; the runner
/// instantiates them into test cases with fresh execution ids. Equality is
/// by name and parameters, so a definition rebuilt from the same inputs
/// matches for [`REMOVE_TEST_CASES`].
#[derive(Clone)]
pub struct TestDefinition {
    run: TestFn,
    name: Arc<str>,
    params: Arc<[TestParam]>,
    module: Option<Arc<str>>,
    class_name: Option<Arc<str>>,
    disabled: Option<Arc<str>>,
    timeout: Option<Duration>,
}

impl TestDefinition {
    /// Creates a definition with the dotted qualified `name` and the body
    /// to execute.
    pub fn new(name: impl Into<Arc<str>>, run: TestFn) -> Self {
        TestDefinition {
            run,
            name: name.into(),
            params: Vec::new().into(),
            module: None,
            class_name: None,
            disabled: None,
            timeout: None,
        }
    }

    /// Sets the parameters this instance of the test runs with.
    #[must_use]
    pub fn with_params(mut self, params: impl IntoIterator<Item = TestParam>) -> Self {
        self.params = params.into_iter().collect();
        self
    }

    /// Sets the module designator used for module scope transitions.
    #[must_use]
    pub fn with_module(mut self, module: impl Into<Arc<str>>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Sets the class designator used for class scope transitions.
    #[must_use]
    pub fn with_class(mut self, class_name: impl Into<Arc<str>>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Marks the definition as disabled. It will be reported as IGNORED
    /// instead of being executed.
    #[must_use]
    pub fn with_disabled(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.disabled = Some(reason.into());
        self
    }

    /// Sets the execution time limit for the test body.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Dotted qualified name, without parameters.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &[TestParam] {
        &self.params
    }

    #[must_use]
    pub fn module(&self) -> Option<&Arc<str>> {
        self.module.as_ref()
    }

    #[must_use]
    pub fn class_name(&self) -> Option<&Arc<str>> {
        self.class_name.as_ref()
    }

    /// The disabled message, when the definition is disabled.
    #[must_use]
    pub fn disabled(&self) -> Option<&Arc<str>> {
        self.disabled.as_ref()
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The executable body.
    #[must_use]
    pub fn run_fn(&self) -> &TestFn {
        &self.run
    }

    pub(crate) fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn params_arc(&self) -> &Arc<[TestParam]> {
        &self.params
    }
}

impl PartialEq for TestDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.params == other.params
    }
}

impl Eq for TestDefinition {}

impl fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDefinition")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testcase::{BoxTestFuture, TestContext};

    fn noop_body() -> TestFn {
        Arc::new(|_context: TestContext| Box::pin(async { Ok(()) }) as BoxTestFuture)
    }

    #[test]
    fn test_topology_defines_all_scheduler_messages() {
        let bus = MessageBus::new();
        define_scheduler_topology(&bus).unwrap();

        assert!(bus.is_endpoint_defined(&SCHEDULER_ENDPOINT));
        for message in [
            &*SCHEDULE_NEXT_TEST,
            &*ADD_TEST_CASES,
            &*REMOVE_TEST_CASES,
            &*CLEAR_RUN_QUEUE,
            &*GET_CURRENT_RUN_QUEUE,
            &*GET_LAST_SCHEDULED_TEST,
            &*SCHEDULING_NEXT_TEST,
            &*RUN_QUEUE_INITIALIZED,
            &*RUN_QUEUE_MODIFIED,
            &*RUN_QUEUE_EMPTY,
        ] {
            assert!(
                bus.is_message_defined_for_endpoint(message, &SCHEDULER_ENDPOINT),
                "message {message} must be defined on the scheduler endpoint"
            );
        }
    }

    #[test]
    fn test_definition_equality_ignores_body() {
        let one = TestDefinition::new("net.test_ping", noop_body())
            .with_params([TestParam::new("ip", "10.0.0.2")]);
        let other = TestDefinition::new("net.test_ping", noop_body())
            .with_params([TestParam::new("ip", "10.0.0.2")]);
        let different = TestDefinition::new("net.test_ping", noop_body())
            .with_params([TestParam::new("ip", "10.0.0.3")]);

        assert_eq!(one, other);
        assert_ne!(one, different);
    }

    #[test]
    fn test_builder_sets_designators() {
        let definition = TestDefinition::new("net.TestPing.test_ping", noop_body())
            .with_module("net")
            .with_class("TestPing")
            .with_disabled("needs lab hardware")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(definition.name(), "net.TestPing.test_ping");
        assert_eq!(definition.module().map(AsRef::as_ref), Some("net"));
        assert_eq!(definition.class_name().map(AsRef::as_ref), Some("TestPing"));
        assert_eq!(
            definition.disabled().map(AsRef::as_ref),
            Some("needs lab hardware")
        );
        assert_eq!(definition.timeout(), Some(Duration::from_secs(5)));
    }
}
