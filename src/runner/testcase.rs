//! # Test case instances and the context a test body runs with.
//!
//! A [`TestCase`] is one scheduled execution of a test definition. It owns
//! the execution id, the cancellation token used to abort the body, and the
//! verdict once the body has finished.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::TestFailure;
use crate::runner::schedule::TestDefinition;
use crate::runner::verdict::Verdict;

static EXECUTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identifies one execution of a test case within the process.
///
/// Ids are unique across runs, so a test case that is scheduled twice gets
/// two distinct ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecutionId(u64);

impl ExecutionId {
    pub(crate) fn next() -> Self {
        ExecutionId(EXECUTION_SEQ.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One parameter value a test case was instantiated with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestParam {
    key: Arc<str>,
    value: Arc<str>,
    requirement: bool,
}

impl TestParam {
    /// Creates an informational parameter.
    #[inline]
    pub fn new(key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        TestParam {
            key: key.into(),
            value: value.into(),
            requirement: false,
        }
    }

    /// Creates a parameter that encodes a requirement of the test.
    #[inline]
    pub fn requirement(key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        TestParam {
            key: key.into(),
            value: value.into(),
            requirement: true,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn is_requirement(&self) -> bool {
        self.requirement
    }
}

impl fmt::Display for TestParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// What a test body receives when it is called.
///
/// The context carries the parameters the case was scheduled with and a
/// cancellation signal. Long-running bodies should select on
/// [`TestContext::cancelled`] so an abort takes effect promptly; bodies that
/// never await cancellation are still raced against the token by the runner.
#[derive(Clone)]
pub struct TestContext {
    cancel: CancellationToken,
    params: Arc<[TestParam]>,
}

impl TestContext {
    #[must_use]
    pub fn params(&self) -> &[TestParam] {
        &self.params
    }

    /// Looks up a parameter value by key.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|param| param.key() == key)
            .map(TestParam::value)
    }

    /// Completes when the test case is aborted.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Whether the test case has been aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Outcome of a test body.
pub type TestResult = Result<(), TestFailure>;

/// Boxed future returned by a test body.
pub type BoxTestFuture = BoxFuture<'static, TestResult>;

/// The executable part of a test definition.
pub type TestFn = Arc<dyn Fn(TestContext) -> BoxTestFuture + Send + Sync>;

struct TestState {
    verdict: Verdict,
    failure: Option<TestFailure>,
}

/// One scheduled execution of a test definition.
///
/// Created by the runner when the scheduler hands out a definition; shared
/// between the run history, the running set and the executing worker.
pub struct TestCase {
    run: TestFn,
    name: Arc<str>,
    params: Arc<[TestParam]>,
    module: Option<Arc<str>>,
    class_name: Option<Arc<str>>,
    disabled: Option<Arc<str>>,
    timeout: Option<Duration>,
    execution_id: ExecutionId,
    cancel: CancellationToken,
    state: Mutex<TestState>,
}

impl TestCase {
    /// Instantiates a definition with a fresh execution id and cancellation
    /// token. The verdict starts out as [`Verdict::Pending`].
    #[must_use]
    pub fn from_definition(definition: &TestDefinition) -> Arc<Self> {
        Arc::new(TestCase {
            run: definition.run_fn().clone(),
            name: definition.name_arc().clone(),
            params: definition.params_arc().clone(),
            module: definition.module().cloned(),
            class_name: definition.class_name().cloned(),
            disabled: definition.disabled().cloned(),
            timeout: definition.timeout(),
            execution_id: ExecutionId::next(),
            cancel: CancellationToken::new(),
            state: Mutex::new(TestState {
                verdict: Verdict::Pending,
                failure: None,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dotted qualified name, without parameters.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Name with the parameter list appended, as shown in logs and reports.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.params.is_empty() {
            return self.name.to_string();
        }
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        format!("{}[{}]", self.name, params.join(","))
    }

    #[must_use]
    pub fn params(&self) -> &[TestParam] {
        &self.params
    }

    /// The module designator, used for module scope transitions.
    #[must_use]
    pub fn module(&self) -> Option<&Arc<str>> {
        self.module.as_ref()
    }

    /// The class designator, used for class scope transitions.
    #[must_use]
    pub fn class_name(&self) -> Option<&Arc<str>> {
        self.class_name.as_ref()
    }

    /// The message attached to a disabled definition, if any.
    #[must_use]
    pub fn disabled(&self) -> Option<&str> {
        self.disabled.as_deref()
    }

    /// Per-case execution time limit, if one was defined.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.state().verdict
    }

    /// The failure the test ended with, if it did not pass.
    #[must_use]
    pub fn failure(&self) -> Option<TestFailure> {
        self.state().failure.clone()
    }

    /// Records the outcome of a finished body and derives the verdict.
    pub(crate) fn update_verdict(&self, failure: Option<TestFailure>) {
        let verdict = Verdict::from_failure(failure.as_ref());
        let mut state = self.state();
        tracing::debug!(
            test_case = %self.name,
            from = %state.verdict,
            to = %verdict,
            "verdict changed"
        );
        state.verdict = verdict;
        state.failure = failure;
    }

    /// Forces a verdict without a recorded failure. Used when a queued case
    /// is skipped without ever running.
    pub(crate) fn set_verdict(&self, verdict: Verdict) {
        let mut state = self.state();
        tracing::debug!(
            test_case = %self.name,
            from = %state.verdict,
            to = %verdict,
            "verdict changed"
        );
        state.verdict = verdict;
    }

    pub(crate) fn run_fn(&self) -> &TestFn {
        &self.run
    }

    /// Builds the context handed to the test body.
    #[must_use]
    pub fn run_context(&self) -> TestContext {
        TestContext {
            cancel: self.cancel.clone(),
            params: Arc::clone(&self.params),
        }
    }

    /// Token that aborts this execution when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("execution_id", &self.execution_id)
            .field("verdict", &self.verdict())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_body() -> TestFn {
        Arc::new(|_context: TestContext| Box::pin(async { Ok(()) }) as BoxTestFuture)
    }

    #[test]
    fn test_full_name_without_params() {
        let definition = TestDefinition::new("suite.test_connect", noop_body());
        let test = TestCase::from_definition(&definition);

        assert_eq!(test.full_name(), "suite.test_connect");
    }

    #[test]
    fn test_full_name_with_params() {
        let definition = TestDefinition::new("suite.test_connect", noop_body()).with_params([
            TestParam::new("ip", "10.0.0.2"),
            TestParam::requirement("board", "rev-b"),
        ]);
        let test = TestCase::from_definition(&definition);

        assert_eq!(test.full_name(), "suite.test_connect[ip=10.0.0.2,board=rev-b]");
    }

    #[test]
    fn test_fresh_case_is_pending() {
        let definition = TestDefinition::new("suite.test_connect", noop_body());
        let test = TestCase::from_definition(&definition);

        assert_eq!(test.verdict(), Verdict::Pending);
        assert!(test.failure().is_none());
    }

    #[test]
    fn test_execution_ids_are_unique() {
        let definition = TestDefinition::new("suite.test_connect", noop_body());
        let first = TestCase::from_definition(&definition);
        let second = TestCase::from_definition(&definition);

        assert_ne!(first.execution_id(), second.execution_id());
    }

    #[test]
    fn test_update_verdict_records_failure() {
        let definition = TestDefinition::new("suite.test_connect", noop_body());
        let test = TestCase::from_definition(&definition);

        test.update_verdict(Some(TestFailure::assertion("values differ")));

        assert_eq!(test.verdict(), Verdict::Failed);
        let failure = test.failure().unwrap();
        assert_eq!(failure.to_string(), "values differ");
    }

    #[test]
    fn test_set_verdict_keeps_failure_empty() {
        let definition = TestDefinition::new("suite.test_connect", noop_body());
        let test = TestCase::from_definition(&definition);

        test.set_verdict(Verdict::Skipped);

        assert_eq!(test.verdict(), Verdict::Skipped);
        assert!(test.failure().is_none());
    }

    #[test]
    fn test_context_param_lookup() {
        let definition = TestDefinition::new("suite.test_connect", noop_body())
            .with_params([TestParam::new("ip", "10.0.0.2")]);
        let test = TestCase::from_definition(&definition);
        let context = test.run_context();

        assert_eq!(context.param("ip"), Some("10.0.0.2"));
        assert_eq!(context.param("port"), None);
        assert!(!context.is_cancelled());
    }
}
