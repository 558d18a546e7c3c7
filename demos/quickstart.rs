//! # Example: quickstart
//!
//! Minimal end-to-end wiring: a run queue, a runner and one reporter.
//!
//! Demonstrates how to:
//! - Declare the bus topology up front.
//! - Seed [`TestScheduler`] with a few test definitions.
//! - Watch `TEST_CASE_FINISHED` with a callback [`Dispatcher`].
//! - Drive the whole queue to a verdict with [`TestRunner::run`].
//!
//! ## Flow
//! ```text
//! TestScheduler ◄── SCHEDULE_NEXT_TEST ─── TestRunner::run(2)
//!       │                                        │
//!       └─► TestDefinition ─────────────────────►│ execute body
//!                                                ├─► TEST_CASE_STARTED
//!                                                ├─► TEST_CASE_FINISHED ──► reporter
//!                                                └─► TEST_RUN_FINISHED
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example quickstart
//! ```

use std::sync::Arc;

use testrig::{
    define_runner_topology, define_scheduler_topology, BoxTestFuture, DirectFactory, Dispatcher,
    HandlerFn, Message, MessageBus, RunnerConfig, Subscription, TestCaseFinished, TestContext,
    TestDefinition, TestFailure, TestRunner, TestScheduler, TEST_CASE_FINISHED,
};

/// A test body that passes or fails depending on `ok`.
fn check(name: &str, ok: bool) -> TestDefinition {
    TestDefinition::new(
        name,
        Arc::new(move |_context: TestContext| {
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(TestFailure::assertion("expected 4 links up, found 3"))
                }
            }) as BoxTestFuture
        }),
    )
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // 1. Declare who talks about what before anything subscribes
    let bus = MessageBus::new();
    define_runner_topology(&bus)?;
    define_scheduler_topology(&bus)?;

    // 2. Seed the run queue
    let scheduler = TestScheduler::new(
        &bus,
        [
            check("demo.test_green", true),
            check("demo.test_red", false),
            check("demo.test_blue", true),
        ],
    );
    scheduler.register()?;

    // 3. Report every finished test case as it happens
    let reporter = Dispatcher::callback(
        &bus,
        HandlerFn::arc("reporter", |message: Message| async move {
            if let Some(finished) = message.data_as::<TestCaseFinished>() {
                match &finished.failure {
                    Some(failure) => println!("{} -> {} ({failure})", finished.name, finished.verdict),
                    None => println!("{} -> {}", finished.name, finished.verdict),
                }
            }
            Ok(None)
        }),
    );
    reporter.register(&Subscription::new([TEST_CASE_FINISHED.clone()]))?;

    // 4. Run the queue dry with two workers
    let runner = TestRunner::new(&bus, Arc::new(DirectFactory), RunnerConfig::default(), "demo");
    let verdict = runner.run(2).await?;
    println!("run verdict: {verdict}");

    reporter.destroy().await;
    scheduler.destroy().await;
    Ok(())
}
