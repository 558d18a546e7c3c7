//! # Example: abort_midrun
//!
//! Aborting a run over the bus while its test cases are still executing.
//!
//! Demonstrates how to:
//! - Expose a [`TestRunner`] on the runner endpoint with [`RunnerService`].
//! - Start a run remotely with a `TEST_RUN` request.
//! - Cancel everything in flight with `CRITICAL_ABORT`.
//!
//! ## Flow
//! ```text
//! main ── TEST_RUN ──► RunnerService ──► TestRunner::run(2)
//!   │                                        ├─► test_stuck_one (hangs)
//!   │                                        └─► test_stuck_two (hangs)
//!   └── CRITICAL_ABORT ─► cancel both ──► verdict: ERROR ──► reply
//! ```
//!
//! ## Run
//! ```bash
//! cargo run --example abort_midrun
//! ```

use std::sync::Arc;
use std::time::Duration;

use testrig::{
    define_runner_topology, define_scheduler_topology, BoxTestFuture, DirectFactory, MessageBus,
    RunnerConfig, RunnerService, TestContext, TestDefinition, TestRunner, TestScheduler, Verdict,
    CRITICAL_ABORT, RUNNER_ENDPOINT, TEST_RUN,
};

/// A test body that never finishes on its own.
fn stuck(name: &str) -> TestDefinition {
    TestDefinition::new(
        name,
        Arc::new(|_context: TestContext| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }) as BoxTestFuture
        }),
    )
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    // 1. Topology, queue and runner, all wired to one bus
    let bus = MessageBus::new();
    define_runner_topology(&bus)?;
    define_scheduler_topology(&bus)?;

    let scheduler = TestScheduler::new(
        &bus,
        [stuck("demo.test_stuck_one"), stuck("demo.test_stuck_two")],
    );
    scheduler.register()?;

    let runner = Arc::new(TestRunner::new(
        &bus,
        Arc::new(DirectFactory),
        RunnerConfig::default(),
        "demo",
    ));
    let service = RunnerService::new(&bus, Arc::clone(&runner), 2);
    service.register()?;

    // 2. Start the run over the bus. The reply resolves once the run is
    //    over, so keep it on its own task.
    let request = tokio::spawn({
        let bus = Arc::clone(&bus);
        async move {
            let replies = bus
                .send_request(&TEST_RUN, Some(&*RUNNER_ENDPOINT), None, None)
                .await;
            match replies.into_iter().next() {
                Some(reply) => reply.recv().await,
                None => Ok(None),
            }
        }
    });

    // 3. Let the test cases hang for a moment, then pull the plug
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("aborting the run");
    bus.trigger_event(&CRITICAL_ABORT, &RUNNER_ENDPOINT, None, None)
        .await?;

    match request.await? {
        Ok(Some(data)) => match data.downcast::<Verdict>() {
            Ok(verdict) => println!("run verdict: {verdict}"),
            Err(_) => println!("run replied with unexpected data"),
        },
        Ok(None) => println!("nothing answered the run request"),
        Err(error) => println!("run failed: {error}"),
    }

    service.destroy().await;
    scheduler.destroy().await;
    Ok(())
}
