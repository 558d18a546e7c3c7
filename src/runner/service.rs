//! # Bus-facing control surface for a test runner.
//!
//! [`RunnerService`] subscribes a [`TestRunner`] to the control messages of
//! the runner endpoint so other participants can drive a run entirely over
//! the bus: [`TEST_RUN`] requests start a run and reply with the verdict,
//! [`ABORT`] / [`CRITICAL_ABORT`] events abort it and
//! [`ABORT_TEST_CASE_REQUEST`] cancels a single test case by execution id.
//!
//! ## Rules
//! - An abort message latches: once seen, later `TEST_RUN` requests are
//!   refused with an error reply instead of starting a run.
//! - Control messages arriving while no run is active are logged and
//!   dropped, never failed.
//! - The run executes inline on the requester's dispatch, so the `TEST_RUN`
//!   reply resolves exactly when the run is over.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::bus::{payload, Message, MessageBus};
use crate::dispatch::{Dispatcher, HandlerFn, Subscription};
use crate::error::BusError;
use crate::runner::messages::{
    AbortTestCaseRequest, ABORT, ABORT_TEST_CASE_REQUEST, CRITICAL_ABORT, TEST_RUN,
};
use crate::runner::runner::TestRunner;

/// Wires a [`TestRunner`] to the runner endpoint's control messages.
pub struct RunnerService {
    runner: Arc<TestRunner>,
    control: Dispatcher,
    abort_case: Dispatcher,
    run: Dispatcher,
}

impl RunnerService {
    /// Builds the service around `runner`. `worker_count` is the
    /// concurrency handed to [`TestRunner::run`] for every `TEST_RUN`
    /// request. Nothing is subscribed until [`RunnerService::register`].
    pub fn new(bus: &Arc<MessageBus>, runner: Arc<TestRunner>, worker_count: usize) -> Self {
        let aborted = Arc::new(AtomicBool::new(false));

        let control = {
            let runner = Arc::clone(&runner);
            let aborted = Arc::clone(&aborted);
            Dispatcher::callback(
                bus,
                HandlerFn::arc("runner-control", move |message: Message| {
                    let runner = Arc::clone(&runner);
                    let aborted = Arc::clone(&aborted);
                    async move {
                        aborted.store(true, AtomicOrdering::SeqCst);
                        if runner.is_stopped() {
                            tracing::warn!(
                                message = %message,
                                "abort received but no test run is active"
                            );
                        } else if message.id() == &*CRITICAL_ABORT {
                            runner.abort_run_immediately();
                        } else {
                            runner.abort_run();
                        }
                        Ok(None)
                    }
                }),
            )
        };

        let abort_case = {
            let runner = Arc::clone(&runner);
            Dispatcher::callback(
                bus,
                HandlerFn::arc("runner-abort-test-case", move |message: Message| {
                    let runner = Arc::clone(&runner);
                    async move {
                        match message.data_as::<AbortTestCaseRequest>().copied() {
                            Some(request) if !runner.is_stopped() => {
                                runner.abort_test_case(request.execution_id);
                            }
                            Some(_) => tracing::warn!(
                                "test case abort received but no test run is active"
                            ),
                            None => tracing::warn!(
                                message = %message,
                                "test case abort without an execution id payload"
                            ),
                        }
                        Ok(None)
                    }
                }),
            )
        };

        let run = {
            let runner = Arc::clone(&runner);
            let aborted = Arc::clone(&aborted);
            Dispatcher::callback(
                bus,
                HandlerFn::arc("runner-run", move |_message: Message| {
                    let runner = Arc::clone(&runner);
                    let aborted = Arc::clone(&aborted);
                    async move {
                        if aborted.load(AtomicOrdering::SeqCst) {
                            return Err(
                                "The test run was aborted before it was started".into()
                            );
                        }
                        let verdict = runner.run(worker_count).await?;
                        Ok(Some(payload(verdict)))
                    }
                }),
            )
        };

        RunnerService {
            runner,
            control,
            abort_case,
            run,
        }
    }

    /// Subscribes all control handlers on the bus.
    pub fn register(&self) -> Result<(), BusError> {
        self.control
            .register(&Subscription::new([ABORT.clone(), CRITICAL_ABORT.clone()]))?;
        self.abort_case
            .register(&Subscription::new([ABORT_TEST_CASE_REQUEST.clone()]))?;
        self.run.register(&Subscription::new([TEST_RUN.clone()]))?;
        Ok(())
    }

    /// Deregisters everything and stops the dispatchers.
    pub async fn destroy(&self) {
        self.run.destroy().await;
        self.abort_case.destroy().await;
        self.control.destroy().await;
    }

    #[must_use]
    pub fn runner(&self) -> &Arc<TestRunner> {
        &self.runner
    }
}
