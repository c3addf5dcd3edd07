//! # Task Completion Primitives
//!
//! A task submitted to an [`AsyncTaskContext`](super::AsyncTaskContext) is split in two
//! halves that share one completion slot:
//! - `TaskHandle`: held by the submitter, used to wait for and take the result
//! - `Completer`: moved into the job, fills the slot exactly once
//!
//! ## Task Lifecycle
//! 1. The context creates a `(TaskHandle, Completer)` pair
//! 2. The job runs on a worker, the timer thread or (in fallback) the caller
//! 3. The job's outcome, or a captured panic, is written through the `Completer`
//! 4. If the job is dropped without running (forced shutdown), the `Completer`'s
//!    `Drop` resolves the handle to an error so no waiter blocks forever

use anyhow::anyhow;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::sync::Arc;
use web_time::{Duration, Instant};

enum SlotState<T> {
    Pending,
    Ready(anyhow::Result<T>),
    Taken,
}

struct CompletionSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> CompletionSlot<T> {
    fn fill(&self, result: anyhow::Result<T>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Ready(result);
            self.ready.notify_all();
        }
    }
}

/// Creates a linked handle/completer pair.
pub(crate) fn task_pair<T>() -> (TaskHandle<T>, Completer<T>) {
    let slot = Arc::new(CompletionSlot {
        state: Mutex::new(SlotState::Pending),
        ready: Condvar::new(),
    });
    (
        TaskHandle { slot: slot.clone() },
        Completer { slot: Some(slot) },
    )
}

/// The submitter's view of a task: completes once with the task's result or error.
///
/// Nothing in this crate requires waiting on a handle; fire-and-forget callers simply
/// drop it.
///
/// # Examples
/// ```
/// use placement_ledger::task_management::{AsyncTaskContext, TaskContextSettings};
///
/// let context = AsyncTaskContext::new("Doc", TaskContextSettings::default());
/// let handle = context.submit(|| Ok(21 * 2));
/// assert_eq!(handle.join().unwrap(), 42);
/// context.shutdown();
/// ```
pub struct TaskHandle<T> {
    slot: Arc<CompletionSlot<T>>,
}

impl<T> TaskHandle<T> {
    /// Returns `true` once the task has produced a result (or failed).
    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Pending)
    }

    /// Blocks for at most `timeout` and reports whether the task has completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                return !matches!(*state, SlotState::Pending);
            }
        }
        true
    }

    /// Blocks until the task completes and returns its result.
    ///
    /// A task that panicked, or was abandoned by a forced shutdown, yields an `Err`.
    pub fn join(self) -> anyhow::Result<T> {
        let mut state = self.slot.state.lock();
        while matches!(*state, SlotState::Pending) {
            self.slot.ready.wait(&mut state);
        }
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(result) => result,
            _ => Err(anyhow!("task result was already taken")),
        }
    }
}

/// The producing half of a task. Completing consumes it; dropping it unfilled fails the
/// paired handle.
pub(crate) struct Completer<T> {
    slot: Option<Arc<CompletionSlot<T>>>,
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, result: anyhow::Result<T>) {
        if let Some(slot) = self.slot.take() {
            slot.fill(result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fill(Err(anyhow!("task was abandoned before it could run")));
        }
    }
}

/// Stand-in deadline for delays too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `start + delay`, clamped to a far-future deadline instead of overflowing.
pub(crate) fn deadline_after(start: Instant, delay: Duration) -> Instant {
    start
        .checked_add(delay)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Renders a caught panic payload for logs and task errors.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
