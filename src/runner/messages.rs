//! # Runner endpoint, message definitions and announcement payloads.
//!
//! Everything the runner says or listens to on the bus is defined here.
//! The runner announces run and test case lifecycle as events and accepts
//! abort requests; [`define_runner_topology`] installs the whole set.
//!
//! ## Contents
//! - [`RUNNER_ENDPOINT`] plus the lifecycle and control message ids.
//! - Payload structs for each announcement.
//! - `trigger_*` helpers the runner uses to publish announcements.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};

use crate::bus::{payload, EndpointId, MessageBus, MessageId};
use crate::error::BusError;
use crate::runner::testcase::{ExecutionId, TestCase};
use crate::runner::verdict::Verdict;

/// The endpoint the runner sends announcements from and receives abort
/// requests on.
pub static RUNNER_ENDPOINT: LazyLock<EndpointId> = LazyLock::new(|| {
    EndpointId::new(
        "testrunner",
        "
        Runs the scheduled test cases and reports their progress.

        Announces run and test case lifecycle events and accepts
        abort requests for the whole run or for single test cases.
        ",
    )
});

/// Starts a test run. Request; the reply carries the run verdict.
pub static TEST_RUN: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "TEST_RUN",
        "
        Requests that a test run is started.

        Answered by the runner service with the final run verdict once
        the run has completed.
        ",
    )
});

/// Event sent when a test run starts. Payload: [`TestRunStarted`].
pub static TEST_RUN_STARTED: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "TEST_RUN_STARTED",
        "Sent when a test run has started.",
    )
});

/// Event sent when a test run completes. Payload: [`TestRunFinished`].
pub static TEST_RUN_FINISHED: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "TEST_RUN_FINISHED",
        "Sent when a test run has completed, with the combined verdict.",
    )
});

/// Event sent when a test case starts. Payload: [`TestCaseStarted`].
pub static TEST_CASE_STARTED: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "TEST_CASE_STARTED",
        "Sent when execution of a test case has started.",
    )
});

/// Event sent when a test case finishes. Payload: [`TestCaseFinished`].
pub static TEST_CASE_FINISHED: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "TEST_CASE_FINISHED",
        "Sent when execution of a test case has finished, with its verdict.",
    )
});

/// Event sent when a queued test case is skipped without running.
/// Payload: [`TestCaseSkipped`].
pub static TEST_CASE_SKIPPED: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "TEST_CASE_SKIPPED",
        "Sent when a queued test case is skipped without being executed.",
    )
});

/// Event requesting that one running test case is aborted.
/// Payload: [`AbortTestCaseRequest`].
pub static ABORT_TEST_CASE_REQUEST: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "ABORT_TEST_CASE_REQUEST",
        "
        Requests that a single running test case is aborted.

        The rest of the run continues; the targeted test case ends with
        an ERROR verdict.
        ",
    )
});

/// Event requesting a graceful stop: running test cases complete, queued
/// ones are skipped.
pub static ABORT: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "ABORT",
        "
        Requests that the test run is aborted.

        Test cases that are already running complete normally; everything
        still queued is skipped.
        ",
    )
});

/// Event requesting an immediate stop: running test cases are cancelled.
pub static CRITICAL_ABORT: LazyLock<MessageId> = LazyLock::new(|| {
    MessageId::new(
        "CRITICAL_ABORT",
        "
        Requests that the test run is aborted immediately.

        Running test cases are cancelled instead of being allowed to
        complete.
        ",
    )
});

/// Defines the runner endpoint and all of its messages on `bus`.
///
/// # Errors
/// Fails when the endpoint or one of the messages is already defined.
pub fn define_runner_topology(bus: &MessageBus) -> Result<(), BusError> {
    bus.define_endpoints_and_messages([(
        RUNNER_ENDPOINT.clone(),
        vec![
            TEST_RUN.clone(),
            TEST_RUN_STARTED.clone(),
            TEST_RUN_FINISHED.clone(),
            TEST_CASE_STARTED.clone(),
            TEST_CASE_FINISHED.clone(),
            TEST_CASE_SKIPPED.clone(),
            ABORT_TEST_CASE_REQUEST.clone(),
            ABORT.clone(),
            CRITICAL_ABORT.clone(),
        ],
    )])
}

/// Payload of [`TEST_RUN_STARTED`].
#[derive(Clone, Debug)]
pub struct TestRunStarted {
    /// Name of the suite being run.
    pub suite: Arc<str>,
    pub time: SystemTime,
}

/// Payload of [`TEST_RUN_FINISHED`].
#[derive(Clone, Debug)]
pub struct TestRunFinished {
    pub verdict: Verdict,
    /// Abort details when the run was aborted, empty otherwise.
    pub message: Arc<str>,
    pub time: SystemTime,
}

/// Payload of [`TEST_CASE_STARTED`].
#[derive(Clone, Debug)]
pub struct TestCaseStarted {
    pub execution_id: ExecutionId,
    /// Name with parameters, as shown in reports.
    pub name: Arc<str>,
    /// Dotted qualified name, without parameters.
    pub qualified_name: Arc<str>,
    /// Execution time limit of the test case, for watchdog subscribers.
    pub timeout: Option<Duration>,
    pub time: SystemTime,
}

/// Payload of [`TEST_CASE_FINISHED`].
#[derive(Clone, Debug)]
pub struct TestCaseFinished {
    pub execution_id: ExecutionId,
    pub name: Arc<str>,
    pub verdict: Verdict,
    /// Rendered failure when the test did not pass.
    pub failure: Option<Arc<str>>,
    pub time: SystemTime,
}

/// Payload of [`TEST_CASE_SKIPPED`].
#[derive(Clone, Debug)]
pub struct TestCaseSkipped {
    pub execution_id: ExecutionId,
    pub name: Arc<str>,
    pub reason: Arc<str>,
    pub time: SystemTime,
}

/// Payload of [`ABORT_TEST_CASE_REQUEST`].
#[derive(Clone, Copy, Debug)]
pub struct AbortTestCaseRequest {
    pub execution_id: ExecutionId,
}

pub(crate) async fn trigger_test_run_started(
    bus: &MessageBus,
    suite: &Arc<str>,
) -> Result<(), BusError> {
    bus.trigger_event(
        &TEST_RUN_STARTED,
        &RUNNER_ENDPOINT,
        None,
        Some(payload(TestRunStarted {
            suite: Arc::clone(suite),
            time: SystemTime::now(),
        })),
    )
    .await
}

pub(crate) async fn trigger_test_run_finished(
    bus: &MessageBus,
    verdict: Verdict,
    message: impl Into<Arc<str>>,
) -> Result<(), BusError> {
    bus.trigger_event(
        &TEST_RUN_FINISHED,
        &RUNNER_ENDPOINT,
        None,
        Some(payload(TestRunFinished {
            verdict,
            message: message.into(),
            time: SystemTime::now(),
        })),
    )
    .await
}

pub(crate) async fn trigger_test_case_started(
    bus: &MessageBus,
    test: &TestCase,
) -> Result<(), BusError> {
    bus.trigger_event(
        &TEST_CASE_STARTED,
        &RUNNER_ENDPOINT,
        None,
        Some(payload(TestCaseStarted {
            execution_id: test.execution_id(),
            name: test.full_name().into(),
            qualified_name: Arc::clone(test.name()),
            timeout: test.timeout(),
            time: SystemTime::now(),
        })),
    )
    .await
}

pub(crate) async fn trigger_test_case_finished(
    bus: &MessageBus,
    test: &TestCase,
) -> Result<(), BusError> {
    bus.trigger_event(
        &TEST_CASE_FINISHED,
        &RUNNER_ENDPOINT,
        None,
        Some(payload(TestCaseFinished {
            execution_id: test.execution_id(),
            name: test.full_name().into(),
            verdict: test.verdict(),
            failure: test.failure().map(|failure| failure.to_string().into()),
            time: SystemTime::now(),
        })),
    )
    .await
}

pub(crate) async fn trigger_test_case_skipped(
    bus: &MessageBus,
    test: &TestCase,
    reason: &str,
) -> Result<(), BusError> {
    bus.trigger_event(
        &TEST_CASE_SKIPPED,
        &RUNNER_ENDPOINT,
        None,
        Some(payload(TestCaseSkipped {
            execution_id: test.execution_id(),
            name: test.full_name().into(),
            reason: reason.into(),
            time: SystemTime::now(),
        })),
    )
    .await
}
