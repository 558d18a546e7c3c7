//! # testrig
//!
//! **Testrig** is the concurrent core of a pluggable test automation
//! framework.
//!
//! It provides an in-process message bus with a declared topology, four
//! dispatch strategies for the handlers that plug into it, and a test
//! runner that drives test cases through setup scopes to a verdict. The
//! crate is designed as a building block: harnesses, reporters and
//! schedulers are all just bus participants.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!            trigger_event / send_request
//!                         │
//!                         ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │  MessageBus (declared topology + routing)                      │
//! │  - endpoints and messages are defined up front                 │
//! │  - events fan out to every subscription                        │
//! │  - requests collect one reply slot per receiving dispatcher    │
//! └───────┬──────────────────────┬──────────────────────┬──────────┘
//!         ▼                      ▼                      ▼
//!  ┌──────────────┐       ┌──────────────┐      ┌───────────────────┐
//!  │  Dispatcher  │       │  Dispatcher  │      │ LocalMessageQueue │
//!  │  (callback)  │       │ (pool of N)  │      │   (pull-style)    │
//!  └──────┬───────┘       └──────┬───────┘      └─────────┬─────────┘
//!         │ inline call          │ queue + workers        │ get()
//!         ▼                      ▼                        ▼
//!    Handle::on_message     Handle::on_message       your own loop
//! ```
//!
//! Two participants ship with the crate and talk over that bus:
//! [`TestRunner`] (behind [`RunnerService`]) executes test cases, and
//! [`TestScheduler`] feeds it from an editable run queue.
//!
//! ### Lifecycle
//! ```text
//! TestRunner::run(workers)
//!
//! loop {
//!   ├─► wait until execution is allowed (pause gate)
//!   ├─► SCHEDULE_NEXT_TEST ──► scheduler endpoint
//!   │       │
//!   │       ├─ Some(definition) ─► exit stale scopes, enter new ones
//!   │       │       ├─► publish TEST_CASE_STARTED
//!   │       │       ├─► run the body (cancellable, panic-safe)
//!   │       │       └─► exit test scope, publish TEST_CASE_FINISHED
//!   │       │
//!   │       └─ None ─► stop once running test cases have drained
//!   │
//!   └─ exit conditions:
//!        - run queue exhausted and every worker idle
//!        - stop_run() or an ABORT / CRITICAL_ABORT message
//!        - pause gate held longer than the configured limit
//! }
//!
//! On exit: still-queued test cases are reported as skipped, the run
//! verdict is folded from every executed test case and TEST_RUN_FINISHED
//! is published.
//! ```
//!
//! ## Features
//! | Area           | Description                                               | Key types / traits                     |
//! |----------------|-----------------------------------------------------------|----------------------------------------|
//! | **Bus**        | Declare topology, route events and requests.              | [`MessageBus`], [`Message`]            |
//! | **Dispatch**   | Decide where each handler runs.                           | [`Dispatcher`], [`DispatchStrategy`]   |
//! | **Queues**     | Pull messages instead of registering callbacks.           | [`LocalMessageQueue`]                  |
//! | **Runner**     | Drive test cases through scopes to a verdict.             | [`TestRunner`], [`RunnerService`]      |
//! | **Scheduling** | Feed the runner from a run queue editable mid-run.        | [`TestDefinition`], [`TestScheduler`]  |
//! | **Errors**     | Typed errors for the bus, dispatch and the runner.        | [`BusError`], [`RunnerError`]          |
//!
//! ## Optional features
//! - `scheduler` _(default)_: the built-in [`TestScheduler`] run queue
//!   serving the scheduler endpoint.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use testrig::{
//!     define_runner_topology, define_scheduler_topology, DirectFactory, MessageBus,
//!     RunnerConfig, TestRunner, Verdict,
//! };
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = MessageBus::new();
//!     define_runner_topology(&bus)?;
//!     define_scheduler_topology(&bus)?;
//!
//!     // Feed one passing test case from the built-in run queue.
//!     #[cfg(feature = "scheduler")]
//!     let scheduler = {
//!         use testrig::{BoxTestFuture, TestContext, TestDefinition, TestScheduler};
//!
//!         let green = TestDefinition::new(
//!             "demo.test_green",
//!             Arc::new(|_context: TestContext| Box::pin(async { Ok(()) }) as BoxTestFuture),
//!         );
//!         let scheduler = TestScheduler::new(&bus, [green]);
//!         scheduler.register()?;
//!         scheduler
//!     };
//!
//!     let runner = TestRunner::new(
//!         &bus,
//!         Arc::new(DirectFactory),
//!         RunnerConfig::default(),
//!         "demo",
//!     );
//!     let verdict = runner.run(1).await?;
//!     assert_eq!(verdict, Verdict::Passed);
//!
//!     #[cfg(feature = "scheduler")]
//!     scheduler.destroy().await;
//!     Ok(())
//! }
//! ```
mod bus;
mod dispatch;
mod error;
mod runner;

// ---- Public re-exports ----

pub use bus::{
    payload, ActivityReport, DispatchResult, DispatcherState, EndpointId, EndpointState, Message,
    MessageBus, MessageId, Payload, Replies, Reply,
};
pub use dispatch::{
    BoxError, DispatchStrategy, Dispatcher, Handle, HandlerFn, HandlerResult, LocalMessageQueue,
    MessageFilter, Subscription,
};
pub use error::{BusError, DispatchError, QueueError, RunnerError, TestFailure};
pub use runner::{
    define_runner_topology, define_scheduler_topology, AbortTestCaseRequest, BoxTestFuture,
    ComponentFactory, DirectFactory, ExecutionId, ExitScopeResult, RunnerConfig, RunnerService,
    Scope, ScopeLevel, ScopeNode, TestCase, TestCaseFinished, TestCaseSkipped, TestCaseStarted,
    TestContext, TestDefinition, TestFn, TestParam, TestResult, TestRunFinished, TestRunStarted,
    TestRunner, Verdict, ABORT, ABORT_TEST_CASE_REQUEST, ADD_TEST_CASES, CLEAR_RUN_QUEUE,
    CRITICAL_ABORT, GET_CURRENT_RUN_QUEUE, GET_LAST_SCHEDULED_TEST, REMOVE_TEST_CASES,
    RUNNER_ENDPOINT, RUN_QUEUE_EMPTY, RUN_QUEUE_INITIALIZED, RUN_QUEUE_MODIFIED,
    SCHEDULER_ENDPOINT, SCHEDULE_NEXT_TEST, SCHEDULING_NEXT_TEST, TEST_CASE_FINISHED,
    TEST_CASE_SKIPPED, TEST_CASE_STARTED, TEST_RUN, TEST_RUN_FINISHED, TEST_RUN_STARTED,
};

// Optional: the built-in run queue behind the scheduler endpoint.
// Enable with: `--features scheduler` (part of the default set).
#[cfg(feature = "scheduler")]
mod scheduler;
#[cfg(feature = "scheduler")]
pub use scheduler::TestScheduler;
