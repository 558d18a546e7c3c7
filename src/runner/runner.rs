//! # The test runner control loop.
//!
//! [`TestRunner::run`] drives a whole test run from a single command queue:
//! worker slots ask for the next test case, the scheduler answers over the
//! bus, and finished test cases free their slot by posting the next request.
//! Test bodies themselves run on spawned tasks, so `worker_count` bodies can
//! execute concurrently while all bookkeeping stays on the control loop.
//!
//! ## Diagram
//! ```text
//!                 ┌────────────────────────────────────────────┐
//!                 │              control loop                  │
//!   NextTestCase ─┤ ask scheduler ──► RunTestCase ─► spawn body│
//!   StopRunning ──┤ drain queue, unwind scopes, stop           │
//!                 └───────────────▲────────────────────────────┘
//!                                 │ NextTestCase (slot free)
//!                          finished test body
//! ```
//!
//! ## Rules
//! - Commands are handled strictly in order; the pause gate is checked
//!   before every command.
//! - A test case that was handed out is always accounted for: it ends in
//!   the run history with a verdict, even when the run is aborted.
//! - Scope teardown failures abort the run after running test cases have
//!   completed; they never change the verdict of a body that already ran.
//! - `abort` latches until the next `run`; `pause` is refused once the run
//!   is aborted.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::dispatch::panic_message;
use crate::error::{RunnerError, TestFailure};
use crate::runner::config::RunnerConfig;
use crate::runner::messages::{
    trigger_test_case_finished, trigger_test_case_skipped, trigger_test_case_started,
    trigger_test_run_finished, trigger_test_run_started,
};
use crate::runner::schedule::{SCHEDULER_ENDPOINT, SCHEDULE_NEXT_TEST, TestDefinition};
use crate::runner::scope::{ComponentFactory, ExitScopeResult, Scope, ScopeLevel};
use crate::runner::testcase::{ExecutionId, TestCase, TestResult};
use crate::runner::verdict::Verdict;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What flows over the runner's command queue.
enum Command {
    /// Stop the run: drain the scheduler and unwind scopes.
    StopRunning { scope: Scope },
    /// A worker slot is free; ask the scheduler for the next test case.
    NextTestCase { scope: Scope },
    /// Execute one test case, continuing from `scope`.
    RunTestCase { scope: Scope, test: Arc<TestCase> },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::StopRunning { .. } => f.write_str("stop_running"),
            Command::NextTestCase { .. } => f.write_str("next_test_case"),
            Command::RunTestCase { test, .. } => {
                write!(f, "run_test_case {}", test.full_name())
            }
        }
    }
}

/// State shared between the control loop, the spawned test bodies and the
/// public control surface.
struct RunnerCore {
    bus: Arc<MessageBus>,
    factory: Arc<dyn ComponentFactory>,
    running: AtomicBool,
    abort: AtomicBool,
    /// Execution gate: `true` while commands may be processed.
    gate: watch::Sender<bool>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    current_scope: Mutex<Option<Scope>>,
    history: Mutex<Vec<Arc<TestCase>>>,
    running_cases: Mutex<Vec<Arc<TestCase>>>,
    abort_failures: Mutex<Vec<Arc<str>>>,
}

/// Runs scheduled test cases and reports their progress on the bus.
///
/// The runner is reusable: once `run` has returned, `run` may be called
/// again. The run history accumulates across runs, but each run's verdict
/// only folds the test cases it executed itself.
pub struct TestRunner {
    core: Arc<RunnerCore>,
    config: RunnerConfig,
    suite_name: Arc<str>,
    parent_scope: Option<Scope>,
}

impl TestRunner {
    pub fn new(
        bus: &Arc<MessageBus>,
        factory: Arc<dyn ComponentFactory>,
        config: RunnerConfig,
        suite_name: impl Into<Arc<str>>,
    ) -> Self {
        let (gate, _) = watch::channel(true);
        TestRunner {
            core: Arc::new(RunnerCore {
                bus: Arc::clone(bus),
                factory,
                running: AtomicBool::new(false),
                abort: AtomicBool::new(false),
                gate,
                commands: Mutex::new(None),
                current_scope: Mutex::new(None),
                history: Mutex::new(Vec::new()),
                running_cases: Mutex::new(Vec::new()),
                abort_failures: Mutex::new(Vec::new()),
            }),
            config,
            suite_name: suite_name.into(),
            parent_scope: None,
        }
    }

    /// Runs below an existing scope instead of at the top of a fresh chain.
    #[must_use]
    pub fn with_parent_scope(mut self, scope: &Scope) -> Self {
        self.parent_scope = Some(scope.clone());
        self
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.core.bus
    }

    #[must_use]
    pub fn suite_name(&self) -> &Arc<str> {
        &self.suite_name
    }

    /// Executes test cases from the scheduler until it is exhausted or the
    /// run is stopped, using up to `worker_count` concurrent test bodies.
    ///
    /// Returns the combined verdict of this run. The abort and pause flags
    /// reset on entry, so a previously aborted runner starts clean.
    ///
    /// # Errors
    /// [`RunnerError::AlreadyRunning`] when a run is still in progress,
    /// [`RunnerError::ExecutionPausedTooLong`] and
    /// [`RunnerError::CommandQueueStalled`] when the configured limits
    /// expire. On these errors in-flight test bodies are awaited, but no
    /// run-finished announcement is made.
    pub async fn run(&self, worker_count: usize) -> Result<Verdict, RunnerError> {
        if self
            .core
            .running
            .compare_exchange(
                false,
                true,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            )
            .is_err()
        {
            return Err(RunnerError::AlreadyRunning);
        }
        self.core.abort.store(false, AtomicOrdering::SeqCst);
        self.core.gate.send_replace(true);
        locked(&self.core.abort_failures).clear();
        let history_start = locked(&self.core.history).len();

        let (commands, mut inbox) = mpsc::unbounded_channel();
        *locked(&self.core.commands) = Some(commands.clone());
        let runner_scope = self
            .core
            .factory
            .enter_scope(ScopeLevel::Runner, self.parent_scope.as_ref(), None);
        *locked(&self.core.current_scope) = Some(runner_scope.clone());

        tracing::info!(suite = %self.suite_name, "Test run started");
        if let Err(error) = trigger_test_run_started(&self.core.bus, &self.suite_name).await {
            tracing::warn!(error = %error, "failed to announce started test run");
        }

        for _ in 0..worker_count.max(1) {
            let _ = commands.send(Command::NextTestCase {
                scope: runner_scope.clone(),
            });
        }

        let mut bodies: Vec<JoinHandle<()>> = Vec::new();
        let mut fatal: Option<RunnerError> = None;
        while self.core.running.load(AtomicOrdering::SeqCst) {
            let command = match self.next_command(&mut inbox).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(error) => {
                    fatal = Some(error);
                    break;
                }
            };
            if let Err(error) = self.wait_until_execution_allowed().await {
                fatal = Some(error);
                break;
            }
            tracing::debug!(command = %command, "executing command");
            match command {
                Command::StopRunning { scope } => {
                    self.handle_stop_running(scope, &runner_scope).await;
                }
                Command::NextTestCase { scope } => {
                    self.handle_next_test_case(scope, &commands).await;
                }
                Command::RunTestCase { scope, test } => {
                    bodies.push(self.handle_run_test_case(scope, test, &commands).await);
                }
            }
            bodies.retain(|body| !body.is_finished());
        }

        *locked(&self.core.commands) = None;
        *locked(&self.core.current_scope) = None;
        drop(commands);
        for body in bodies {
            let _ = body.await;
        }
        self.core.running.store(false, AtomicOrdering::SeqCst);

        if let Some(error) = fatal {
            return Err(error);
        }

        let verdict = self.core.run_verdict(history_start);
        tracing::info!(verdict = %verdict, "Test run completed");
        if let Err(error) =
            trigger_test_run_finished(&self.core.bus, verdict, self.core.abort_message()).await
        {
            tracing::warn!(error = %error, "failed to announce finished test run");
        }
        Ok(verdict)
    }

    async fn next_command(
        &self,
        inbox: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<Option<Command>, RunnerError> {
        match self.config.command_wait_limit() {
            None => Ok(inbox.recv().await),
            Some(limit) => match tokio::time::timeout(limit, inbox.recv()).await {
                Ok(command) => Ok(command),
                Err(_) => Err(RunnerError::CommandQueueStalled { timeout: limit }),
            },
        }
    }

    async fn wait_until_execution_allowed(&self) -> Result<(), RunnerError> {
        if *self.core.gate.borrow() {
            return Ok(());
        }
        tracing::debug!("execution paused, waiting for resume");
        let mut gate = self.core.gate.subscribe();
        let reopened = gate.wait_for(|allowed| *allowed);
        match self.config.pause_wait_limit() {
            None => {
                let _ = reopened.await;
                Ok(())
            }
            Some(limit) => {
                if tokio::time::timeout(limit, reopened).await.is_err() {
                    tracing::error!(
                        timeout = ?limit,
                        "execution paused for longer than allowed, failing the run"
                    );
                    return Err(RunnerError::ExecutionPausedTooLong { timeout: limit });
                }
                Ok(())
            }
        }
    }

    /// Asks the scheduler for the next test case. `Ok(None)` means the
    /// queue is exhausted.
    async fn request_next_test_case(&self) -> Result<Option<Arc<TestCase>>, RunnerError> {
        let replies = self
            .core
            .bus
            .send_request(&SCHEDULE_NEXT_TEST, Some(&*SCHEDULER_ENDPOINT), None, None)
            .await;
        let Some(reply) = replies.into_iter().next() else {
            return Err(RunnerError::SchedulerUnavailable {
                reason: "nothing is registered for scheduling requests".into(),
            });
        };
        let outcome = match self.config.schedule_wait_limit() {
            Some(limit) => reply.recv_timeout(limit).await,
            None => reply.recv().await,
        };
        let data = outcome.map_err(|error| RunnerError::SchedulerUnavailable {
            reason: error.to_string().into(),
        })?;
        match data {
            None => Ok(None),
            Some(data) => match data.downcast::<TestDefinition>() {
                Ok(definition) => Ok(Some(TestCase::from_definition(&definition))),
                Err(_) => Err(RunnerError::UnexpectedReply),
            },
        }
    }

    async fn handle_next_test_case(
        &self,
        scope: Scope,
        commands: &mpsc::UnboundedSender<Command>,
    ) {
        let running = self.core.running.load(AtomicOrdering::SeqCst);
        let abort = self.core.abort.load(AtomicOrdering::SeqCst);
        if running && !abort {
            match self.request_next_test_case().await {
                Ok(Some(test)) => {
                    let _ = commands.send(Command::RunTestCase { scope, test });
                }
                Ok(None) => self.stop_if_idle(&scope),
                Err(error) => {
                    tracing::error!(
                        error = %error,
                        "could not get the next test case, stopping the run"
                    );
                    self.stop_if_idle(&scope);
                }
            }
        } else {
            self.stop_if_idle(&scope);
        }
    }

    /// Stops the run once no test cases are executing anymore. With several
    /// workers the last one to finish triggers the stop.
    fn stop_if_idle(&self, scope: &Scope) {
        if locked(&self.core.running_cases).is_empty() {
            self.core.post_stop(scope.clone());
        }
    }

    async fn handle_run_test_case(
        &self,
        scope: Scope,
        test: Arc<TestCase>,
        commands: &mpsc::UnboundedSender<Command>,
    ) -> JoinHandle<()> {
        tracing::info!(test_case = %test.full_name(), "Test case started");
        if let Err(error) = trigger_test_case_started(&self.core.bus, &test).await {
            tracing::warn!(error = %error, "failed to announce started test case");
        }
        let core = Arc::clone(&self.core);
        let commands = commands.clone();
        tokio::spawn(async move {
            core.execute_test_case(scope, test, commands).await;
        })
    }

    async fn handle_stop_running(&self, scope: Scope, runner_scope: &Scope) {
        self.core.running.store(false, AtomicOrdering::SeqCst);

        // Everything still queued is drained and reported as skipped.
        loop {
            let next = match self.request_next_test_case().await {
                Ok(next) => next,
                Err(error) => {
                    tracing::error!(error = %error, "could not drain the run queue");
                    break;
                }
            };
            let Some(test) = next else { break };
            test.set_verdict(Verdict::Skipped);
            if let Err(error) = trigger_test_case_skipped(
                &self.core.bus,
                &test,
                "Skipped because run was aborted",
            )
            .await
            {
                tracing::warn!(error = %error, "failed to announce skipped test case");
            }
            tracing::info!(
                test_case = %test.name(),
                verdict = %test.verdict(),
                "Test case skipped because run was aborted"
            );
            locked(&self.core.history).push(test);
        }

        // Unwind from where the last test case left off down to and
        // including the runner scope. Teardown failures no longer matter.
        let mut scope = scope;
        while !Arc::ptr_eq(&scope, runner_scope) {
            let result = self.core.factory.exit_scope(scope).await;
            match result.scope {
                Some(parent) => scope = parent,
                None => return,
            }
        }
        let _ = self.core.factory.exit_scope(scope).await;
    }

    /// Requests a graceful stop of the current run.
    pub fn stop_run(&self) {
        let scope = locked(&self.core.current_scope).clone();
        match scope {
            Some(scope) => self.core.post_stop(scope),
            None => tracing::debug!("no test run in progress, ignoring stop"),
        }
    }

    /// Closes the execution gate. Ignored once the run is aborted, so an
    /// abort cannot be stalled by a pause.
    pub fn pause_execution(&self) {
        self.core.pause_execution();
    }

    /// Reopens the execution gate.
    pub fn resume_execution(&self) {
        self.core.resume_execution();
    }

    /// Aborts the run: running test cases complete, queued ones are
    /// skipped.
    pub fn abort_run(&self) {
        self.core.abort_run();
    }

    /// Aborts the run and cancels the test cases that are executing right
    /// now.
    pub fn abort_run_immediately(&self) {
        self.core.abort_run_immediately();
    }

    /// Cancels one running test case. Returns whether the execution id
    /// matched a running test case.
    pub fn abort_test_case(&self, execution_id: ExecutionId) -> bool {
        self.core.abort_test_case(execution_id)
    }

    /// True while the run is executing and not paused.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.running.load(AtomicOrdering::SeqCst) && !self.is_paused()
    }

    /// True when the gate is closed and every running test case has
    /// finished, so execution has actually come to rest.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.core.running.load(AtomicOrdering::SeqCst)
            && !*self.core.gate.borrow()
            && locked(&self.core.running_cases).is_empty()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        !self.core.running.load(AtomicOrdering::SeqCst)
    }

    /// True when the run was aborted and has come to a stop.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.core.abort.load(AtomicOrdering::SeqCst) && self.is_stopped()
    }

    /// Every test case this runner has accounted for, in completion order.
    #[must_use]
    pub fn run_history(&self) -> Vec<Arc<TestCase>> {
        locked(&self.core.history).clone()
    }

    /// The test cases executing right now.
    #[must_use]
    pub fn running_test_cases(&self) -> Vec<Arc<TestCase>> {
        locked(&self.core.running_cases).clone()
    }
}

impl RunnerCore {
    fn post_stop(&self, scope: Scope) {
        let commands = locked(&self.commands);
        match commands.as_ref() {
            Some(sender) => {
                tracing::info!("Stopping test run");
                let _ = sender.send(Command::StopRunning { scope });
            }
            None => tracing::debug!("no test run in progress, ignoring stop"),
        }
    }

    fn pause_execution(&self) {
        if self.abort.load(AtomicOrdering::SeqCst) {
            return;
        }
        tracing::info!("Pausing execution of test run");
        self.gate.send_replace(false);
    }

    fn resume_execution(&self) {
        if !*self.gate.borrow() {
            tracing::info!("Resuming execution of test run");
            self.gate.send_replace(true);
        }
    }

    fn abort_run(&self) {
        tracing::info!("Aborting after running test cases have completed");
        self.abort.store(true, AtomicOrdering::SeqCst);
    }

    fn abort_run_immediately(&self) {
        tracing::info!("Aborting test run immediately");
        self.abort.store(true, AtomicOrdering::SeqCst);
        self.resume_execution();
        for test in locked(&self.running_cases).iter() {
            test.cancel_token().cancel();
        }
    }

    fn abort_test_case(&self, execution_id: ExecutionId) -> bool {
        let cases = locked(&self.running_cases);
        match cases.iter().find(|test| test.execution_id() == execution_id) {
            Some(test) => {
                tracing::info!(test_case = %test.full_name(), "Aborting test case");
                test.cancel_token().cancel();
                true
            }
            None => {
                tracing::warn!(
                    execution_id = %execution_id,
                    "no running test case with this execution id"
                );
                false
            }
        }
    }

    /// Runs one test case on a worker task and accounts for its outcome.
    async fn execute_test_case(
        self: Arc<Self>,
        scope: Scope,
        test: Arc<TestCase>,
        commands: mpsc::UnboundedSender<Command>,
    ) {
        locked(&self.running_cases).push(Arc::clone(&test));
        let mut scope = scope;
        let outcome = self.run_test_case(&mut scope, &test).await;
        locked(&self.running_cases)
            .retain(|running| running.execution_id() != test.execution_id());

        // A skip anywhere in the cause chain makes the whole outcome a
        // skip, so preparation failures do not masquerade as test failures.
        let failure = outcome.err().map(|failure| match failure.find_skip() {
            Some(skip) => skip.clone(),
            None => failure.clone(),
        });
        test.update_verdict(failure);
        locked(&self.history).push(Arc::clone(&test));
        if let Err(error) = trigger_test_case_finished(&self.bus, &test).await {
            tracing::warn!(error = %error, "failed to announce finished test case");
        }
        tracing::info!(
            test_case = %test.full_name(),
            verdict = %test.verdict(),
            "Test case completed"
        );
        let _ = commands.send(Command::NextTestCase { scope });
    }

    async fn run_test_case(&self, scope: &mut Scope, test: &Arc<TestCase>) -> TestResult {
        if self.abort.load(AtomicOrdering::SeqCst) {
            return Err(TestFailure::skip("Skipped because run was aborted"));
        }
        if let Some(reason) = test.disabled() {
            return Err(TestFailure::disabled(reason));
        }

        let stale = self.exit_stale_scopes(scope.clone(), test).await;
        if let Some(current) = stale.scope {
            *scope = current;
        }
        if !stale.success {
            let cause = self.record_exit_failures(test, stale.failures);
            return Err(TestFailure::skip_caused_by(
                "Skipping test case due to failures in preparation",
                cause,
            ));
        }

        *scope = self.enter_scopes(scope.clone(), test);
        tracing::debug!(test_case = %test.full_name(), scope = %scope, "calling test case");
        let verdict = self.call_test_body(scope, test).await;

        // The test scope always exits, but a teardown failure must not
        // overwrite the verdict of a body that already ran.
        let exited = self.factory.exit_scope(scope.clone()).await;
        if !exited.success {
            let _ = self.record_exit_failures(test, exited.failures);
        }
        if let Some(current) = exited.scope {
            *scope = current;
        }
        verdict
    }

    async fn call_test_body(&self, scope: &Scope, test: &Arc<TestCase>) -> TestResult {
        let context = test.run_context();
        let cancel = test.cancel_token().clone();
        let body = AssertUnwindSafe(self.factory.call(test.run_fn(), context, scope))
            .catch_unwind();
        tokio::select! {
            outcome = body => match outcome {
                Ok(result) => result,
                Err(panic) => Err(TestFailure::assertion(panic_message(panic))),
            },
            () = cancel.cancelled() => Err(TestFailure::aborted("Test case was aborted")),
        }
    }

    /// Exits the scopes the previous test case left behind that the next
    /// one does not share: the test scope always, class and module scopes
    /// when their designator differs.
    async fn exit_stale_scopes(&self, scope: Scope, test: &TestCase) -> ExitScopeResult {
        let mut result = ExitScopeResult::passed(None);
        let mut scope = scope;
        if scope.level() == ScopeLevel::Test {
            result.combine(self.factory.exit_scope(scope.clone()).await);
            if let Some(parent) = scope.parent().cloned() {
                scope = parent;
            }
        }
        if scope.level() == ScopeLevel::Class
            && scope.data() != test.class_name().map(|name| &**name)
        {
            result.combine(self.factory.exit_scope(scope.clone()).await);
            if let Some(parent) = scope.parent().cloned() {
                scope = parent;
            }
        }
        if scope.level() == ScopeLevel::Module
            && scope.data() != test.module().map(|name| &**name)
        {
            result.combine(self.factory.exit_scope(scope.clone()).await);
            if let Some(parent) = scope.parent().cloned() {
                scope = parent;
            }
        }
        result.scope = Some(scope);
        result
    }

    /// Enters the scopes the test case needs: module when coming from the
    /// runner scope, class when the test has one, and always a test scope.
    fn enter_scopes(&self, scope: Scope, test: &TestCase) -> Scope {
        let mut scope = scope;
        if scope.level() == ScopeLevel::Runner {
            scope = self.factory.enter_scope(
                ScopeLevel::Module,
                Some(&scope),
                test.module().cloned(),
            );
        }
        if scope.level() == ScopeLevel::Module
            && scope.data() == test.module().map(|name| &**name)
            && test.class_name().is_some()
        {
            scope = self.factory.enter_scope(
                ScopeLevel::Class,
                Some(&scope),
                test.class_name().cloned(),
            );
        }
        self.factory.enter_scope(
            ScopeLevel::Test,
            Some(&scope),
            Some(Arc::clone(test.name())),
        )
    }

    /// Records scope teardown failures: the run aborts after running test
    /// cases have completed and the failure text ends up in the
    /// run-finished announcement.
    fn record_exit_failures(&self, test: &TestCase, failures: Vec<TestFailure>) -> TestFailure {
        self.abort_run();
        let details: Vec<String> = failures.iter().map(ToString::to_string).collect();
        let message = format!(
            "Error(s) occurred when exiting test case {}. Aborting run:\n{}",
            test.name(),
            details.join("\n")
        );
        tracing::error!("{message}");
        locked(&self.abort_failures).push(message.clone().into());
        match failures.into_iter().next() {
            Some(first) => TestFailure::error_caused_by(message, first),
            None => TestFailure::error(message),
        }
    }

    fn run_verdict(&self, from: usize) -> Verdict {
        let mut verdict = Verdict::Passed;
        if self.abort.load(AtomicOrdering::SeqCst) {
            verdict = Verdict::Error;
        }
        for test in locked(&self.history).iter().skip(from) {
            verdict = verdict.combine(test.verdict());
        }
        verdict
    }

    fn abort_message(&self) -> String {
        locked(&self.abort_failures).join("\n")
    }
}
