//! # How a dispatcher turns deliveries into handler invocations.
//!
//! ```text
//!   Callback     caller ──────────────► handler        (inline, blocking)
//!   Sequential   caller ─► [queue] ─► 1 worker         (FIFO, full order)
//!   Concurrent   caller ─► spawn ───► task per message (no order, no cap)
//!   Pool(n)      caller ─► [queue] ─► n workers        (FIFO pickup)
//! ```
//!
//! ## Rules
//! - Callback has no backpressure at all: the sender awaits the handler.
//! - Sequential guarantees full ordering with unbounded queue depth.
//! - Concurrent spawns one task per message; unbounded task creation is
//!   the caller's risk.
//! - Pool picks up FIFO but completes in worker availability order.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::{Message, ReplySlot};

/// Delivery execution strategy of a dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Run the handler inline on the sending task.
    Callback,
    /// One worker task draining a FIFO queue.
    Sequential,
    /// One spawned task per delivered message.
    Concurrent,
    /// `n` worker tasks draining a shared FIFO queue. `Pool(0)` uses the
    /// default of five workers per available core.
    Pool(usize),
}

impl DispatchStrategy {
    /// Number of queue workers the strategy runs. Zero means the strategy
    /// does not use a queue.
    pub(crate) fn worker_count(&self) -> usize {
        match self {
            DispatchStrategy::Callback | DispatchStrategy::Concurrent => 0,
            DispatchStrategy::Sequential => 1,
            DispatchStrategy::Pool(0) => default_pool_workers(),
            DispatchStrategy::Pool(n) => *n,
        }
    }
}

/// Default worker count for [`DispatchStrategy::Pool`].
pub(crate) fn default_pool_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 5
}

/// One queued delivery.
pub(crate) struct Job {
    pub(crate) message: Message,
    pub(crate) reply: Option<ReplySlot>,
}

/// Live worker resources of one dispatcher.
///
/// `sender` feeds the queue for queue-based strategies; `tasks` holds the
/// worker tasks (or, for `Concurrent`, the per-message tasks) so `stop`
/// can await them.
#[derive(Default)]
pub(crate) struct WorkerState {
    pub(crate) sender: Option<mpsc::UnboundedSender<Job>>,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}
