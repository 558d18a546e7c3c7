//! Test runner: scheduling loop, scopes, verdicts and lifecycle messages.
//!
//! The runner pulls test definitions from whatever answers
//! [`SCHEDULE_NEXT_TEST`] on the scheduler endpoint, executes them inside a
//! scope chain managed by a [`ComponentFactory`] and reports every step on
//! the bus as lifecycle messages.
//!
//! ## Contents
//! - [`TestRunner`] the command loop driving one run at a time
//! - [`RunnerService`] bus-facing control surface (`TEST_RUN`, aborts)
//! - [`TestDefinition`] what a scheduler hands out, [`TestCase`] one
//!   execution of it, [`Verdict`] the outcome model
//! - [`ComponentFactory`] / [`Scope`] the fixture seam around test bodies
//! - [`RunnerConfig`] wait limits for the control loop
//! - `messages` / `schedule` statics: endpoint and message identities plus
//!   the payload structs carried by lifecycle messages
//!
//! ## Quick wiring
//! ```text
//! define_runner_topology(&bus)      + define_scheduler_topology(&bus)
//!   ├─ TestRunner::new(&bus, factory, config, suite).run(workers)
//!   │     └─► SCHEDULE_NEXT_TEST ──► TestDefinition ──► TestCase
//!   └─ RunnerService::new(&bus, runner, workers).register()
//!         └─► TEST_RUN request ──► run ──► Verdict reply
//! ```

mod config;
mod messages;
#[allow(clippy::module_inception)]
mod runner;
mod schedule;
mod scope;
mod service;
mod testcase;
mod verdict;

pub use config::RunnerConfig;
pub use messages::{
    define_runner_topology, AbortTestCaseRequest, TestCaseFinished, TestCaseSkipped,
    TestCaseStarted, TestRunFinished, TestRunStarted, ABORT, ABORT_TEST_CASE_REQUEST,
    CRITICAL_ABORT, RUNNER_ENDPOINT, TEST_CASE_FINISHED, TEST_CASE_SKIPPED, TEST_CASE_STARTED,
    TEST_RUN, TEST_RUN_FINISHED, TEST_RUN_STARTED,
};
pub use runner::TestRunner;
pub use schedule::{
    define_scheduler_topology, TestDefinition, ADD_TEST_CASES, CLEAR_RUN_QUEUE,
    GET_CURRENT_RUN_QUEUE, GET_LAST_SCHEDULED_TEST, REMOVE_TEST_CASES, RUN_QUEUE_EMPTY,
    RUN_QUEUE_INITIALIZED, RUN_QUEUE_MODIFIED, SCHEDULER_ENDPOINT, SCHEDULE_NEXT_TEST,
    SCHEDULING_NEXT_TEST,
};
pub use scope::{ComponentFactory, DirectFactory, ExitScopeResult, Scope, ScopeLevel, ScopeNode};
pub use service::RunnerService;
pub use testcase::{
    BoxTestFuture, ExecutionId, TestCase, TestContext, TestFn, TestParam, TestResult,
};
pub use verdict::Verdict;
