//! # The default run queue behind the scheduling endpoint.
//!
//! [`TestScheduler`] owns an ordered queue of [`TestDefinition`]s and
//! answers the scheduler endpoint's API messages: [`SCHEDULE_NEXT_TEST`]
//! pops the front, [`ADD_TEST_CASES`] / [`REMOVE_TEST_CASES`] /
//! [`CLEAR_RUN_QUEUE`] edit the queue mid-run and the `GET_*` requests
//! expose snapshots. Queue changes are announced as events so observers can
//! follow the run plan as it evolves.
//!
//! ## Rules
//! - The queue initializes lazily on the first API message; an abort seen
//!   before that point discards the seeded test cases.
//! - After an abort the queue refuses additions but keeps serving what is
//!   already queued, so the runner can account for every test case.
//! - [`RUN_QUEUE_EMPTY`] fires before the pop decision is final; a
//!   subscriber that refills the queue while handling the event is honored.
//! - The state lock is never held while bus messages are triggered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bus::{payload, Message, MessageBus};
use crate::dispatch::{Dispatcher, HandlerFn, HandlerResult, Subscription};
use crate::error::BusError;
use crate::runner::{
    TestDefinition, ABORT, ADD_TEST_CASES, CLEAR_RUN_QUEUE, CRITICAL_ABORT,
    GET_CURRENT_RUN_QUEUE, GET_LAST_SCHEDULED_TEST, REMOVE_TEST_CASES, RUN_QUEUE_EMPTY,
    RUN_QUEUE_INITIALIZED, RUN_QUEUE_MODIFIED, SCHEDULER_ENDPOINT, SCHEDULE_NEXT_TEST,
    SCHEDULING_NEXT_TEST,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SchedulerState {
    /// Test cases waiting for the lazy initialization.
    seed: Vec<TestDefinition>,
    /// `None` until the first API message arrives.
    run_queue: Option<VecDeque<TestDefinition>>,
    last_scheduled: Option<TestDefinition>,
}

struct SchedulerCore {
    bus: Arc<MessageBus>,
    state: Mutex<SchedulerState>,
    aborted: AtomicBool,
}

/// Serves the scheduler endpoint from an in-memory run queue.
pub struct TestScheduler {
    core: Arc<SchedulerCore>,
    api: Dispatcher,
    abort: Dispatcher,
}

impl TestScheduler {
    /// Builds a scheduler seeded with `tests`, in run order. Nothing is
    /// subscribed until [`TestScheduler::register`].
    pub fn new(bus: &Arc<MessageBus>, tests: impl IntoIterator<Item = TestDefinition>) -> Self {
        let core = Arc::new(SchedulerCore {
            bus: Arc::clone(bus),
            state: Mutex::new(SchedulerState {
                seed: tests.into_iter().collect(),
                run_queue: None,
                last_scheduled: None,
            }),
            aborted: AtomicBool::new(false),
        });

        let api = {
            let core = Arc::clone(&core);
            Dispatcher::concurrent(
                bus,
                HandlerFn::arc("scheduler-api", move |message: Message| {
                    let core = Arc::clone(&core);
                    async move { core.handle_api_message(message).await }
                }),
            )
        };

        let abort = {
            let core = Arc::clone(&core);
            Dispatcher::callback(
                bus,
                HandlerFn::arc("scheduler-abort", move |_message: Message| {
                    let core = Arc::clone(&core);
                    async move {
                        core.aborted.store(true, AtomicOrdering::SeqCst);
                        Ok(None)
                    }
                }),
            )
        };

        TestScheduler { core, api, abort }
    }

    /// Subscribes the API handler on the scheduler endpoint and the abort
    /// latch on the abort messages, wherever they are defined.
    pub fn register(&self) -> Result<(), BusError> {
        self.api.register(
            &Subscription::new([
                SCHEDULE_NEXT_TEST.clone(),
                ADD_TEST_CASES.clone(),
                REMOVE_TEST_CASES.clone(),
                CLEAR_RUN_QUEUE.clone(),
                GET_CURRENT_RUN_QUEUE.clone(),
                GET_LAST_SCHEDULED_TEST.clone(),
            ])
            .with_endpoint(&SCHEDULER_ENDPOINT),
        )?;
        self.abort
            .register(&Subscription::new([ABORT.clone(), CRITICAL_ABORT.clone()]))?;
        Ok(())
    }

    /// Deregisters everything and stops the dispatchers.
    pub async fn destroy(&self) {
        self.api.destroy().await;
        self.abort.destroy().await;
    }

    /// The test cases still queued, front first.
    #[must_use]
    pub fn current_run_queue(&self) -> Vec<TestDefinition> {
        self.core.current_run_queue()
    }
}

impl SchedulerCore {
    async fn handle_api_message(&self, message: Message) -> HandlerResult {
        self.ensure_initialized().await;
        let id = message.id();
        if id == &*SCHEDULE_NEXT_TEST {
            Ok(self.schedule_next().await.map(payload))
        } else if id == &*GET_CURRENT_RUN_QUEUE {
            Ok(Some(payload(self.current_run_queue())))
        } else if id == &*ADD_TEST_CASES {
            match message.data_as::<Vec<TestDefinition>>() {
                Some(added) => self.add_test_cases(added.clone()).await,
                None => {
                    tracing::warn!(message = %message, "add request without test case payload");
                }
            }
            Ok(None)
        } else if id == &*REMOVE_TEST_CASES {
            match message.data_as::<Vec<TestDefinition>>() {
                Some(remove) => Ok(Some(payload(self.remove_test_cases(remove.clone()).await))),
                None => {
                    tracing::warn!(message = %message, "remove request without test case payload");
                    Ok(None)
                }
            }
        } else if id == &*CLEAR_RUN_QUEUE {
            Ok(Some(payload(self.clear_run_queue())))
        } else {
            Ok(self.last_scheduled().map(payload))
        }
    }

    /// Builds the run queue from the seed on first use. An abort that
    /// arrived earlier leaves the queue empty.
    async fn ensure_initialized(&self) {
        let initialized = {
            let mut state = locked(&self.state);
            if state.run_queue.is_some() {
                None
            } else {
                let seed = std::mem::take(&mut state.seed);
                let queue: VecDeque<TestDefinition> =
                    if self.aborted.load(AtomicOrdering::SeqCst) {
                        VecDeque::new()
                    } else {
                        seed.into()
                    };
                let snapshot: Vec<TestDefinition> = queue.iter().cloned().collect();
                state.run_queue = Some(queue);
                Some(snapshot)
            }
        };
        if let Some(snapshot) = initialized {
            tracing::debug!(queued = snapshot.len(), "run queue initialized");
            if let Err(error) = self
                .bus
                .trigger_event(
                    &RUN_QUEUE_INITIALIZED,
                    &SCHEDULER_ENDPOINT,
                    None,
                    Some(payload(snapshot)),
                )
                .await
            {
                tracing::warn!(error = %error, "failed to announce initialized run queue");
            }
        }
    }

    async fn schedule_next(&self) -> Option<TestDefinition> {
        if let Err(error) = self
            .bus
            .trigger_event(&SCHEDULING_NEXT_TEST, &SCHEDULER_ENDPOINT, None, None)
            .await
        {
            tracing::warn!(error = %error, "failed to announce scheduling");
        }

        let empty = locked(&self.state)
            .run_queue
            .as_ref()
            .map_or(true, VecDeque::is_empty);
        if empty {
            // Subscribers may refill the queue while handling this event,
            // so the pop below looks again.
            if let Err(error) = self
                .bus
                .trigger_event(&RUN_QUEUE_EMPTY, &SCHEDULER_ENDPOINT, None, None)
                .await
            {
                tracing::warn!(error = %error, "failed to announce empty run queue");
            }
        }

        let next = {
            let mut state = locked(&self.state);
            let next = state.run_queue.as_mut().and_then(VecDeque::pop_front);
            if let Some(test) = &next {
                state.last_scheduled = Some(test.clone());
            }
            next
        };
        if let Some(test) = &next {
            tracing::debug!(test_case = %test.name(), "scheduled next test case");
        }
        next
    }

    fn current_run_queue(&self) -> Vec<TestDefinition> {
        locked(&self.state)
            .run_queue
            .as_ref()
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn add_test_cases(&self, added: Vec<TestDefinition>) {
        if self.aborted.load(AtomicOrdering::SeqCst) {
            tracing::debug!("run queue no longer accepts test cases after abort");
            return;
        }
        let snapshot = {
            let mut state = locked(&self.state);
            if let Some(queue) = state.run_queue.as_mut() {
                queue.extend(added);
                queue.iter().cloned().collect::<Vec<_>>()
            } else {
                Vec::new()
            }
        };
        self.announce_modified(snapshot).await;
    }

    async fn remove_test_cases(&self, remove: Vec<TestDefinition>) -> Vec<TestDefinition> {
        let (removed, snapshot) = {
            let mut state = locked(&self.state);
            let mut removed = Vec::new();
            if let Some(queue) = state.run_queue.as_mut() {
                for target in &remove {
                    removed.extend(queue.iter().filter(|test| *test == target).cloned());
                    queue.retain(|test| test != target);
                }
            }
            let snapshot = state
                .run_queue
                .as_ref()
                .map(|queue| queue.iter().cloned().collect())
                .unwrap_or_default();
            (removed, snapshot)
        };
        self.announce_modified(snapshot).await;
        removed
    }

    async fn announce_modified(&self, snapshot: Vec<TestDefinition>) {
        if let Err(error) = self
            .bus
            .trigger_event(
                &RUN_QUEUE_MODIFIED,
                &SCHEDULER_ENDPOINT,
                None,
                Some(payload(snapshot)),
            )
            .await
        {
            tracing::warn!(error = %error, "failed to announce modified run queue");
        }
    }

    fn clear_run_queue(&self) -> Vec<TestDefinition> {
        locked(&self.state)
            .run_queue
            .as_mut()
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn last_scheduled(&self) -> Option<TestDefinition> {
        locked(&self.state).last_scheduled.clone()
    }
}
