//! # Scheduler Thread
//!
//! A single dedicated thread per context that runs delayed and fixed-rate jobs in
//! deadline order. Jobs run on the scheduler thread itself, so a slow job delays the
//! ones queued behind it.
//!
//! On graceful shutdown repeating jobs are dropped, one-shot jobs still fire at their
//! deadlines, and the thread exits once the queue is empty. On forced termination the
//! remaining queue is dropped, which fails the paired task handles.

use super::task::deadline_after;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use web_time::{Duration, Instant};

pub(crate) type OnceJob = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type RepeatingJob = Box<dyn FnMut() + Send + 'static>;

enum ScheduledJob {
    Once(OnceJob),
    Repeating { job: RepeatingJob, period: Duration },
}

struct ScheduledEntry {
    deadline: Instant,
    sequence: u64,
    job: ScheduledJob,
}

// BinaryHeap is a max-heap; reverse so the earliest deadline (then earliest
// submission) sits on top.
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for ScheduledEntry {}

#[derive(Default)]
struct TimerQueue {
    entries: BinaryHeap<ScheduledEntry>,
    next_sequence: u64,
    shutting_down: bool,
}

/// State shared between a context and its scheduler thread.
pub(crate) struct TimerShared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
    terminated: Arc<AtomicBool>,
}

impl TimerShared {
    pub(crate) fn new(terminated: Arc<AtomicBool>) -> Self {
        Self {
            queue: Mutex::new(TimerQueue::default()),
            wakeup: Condvar::new(),
            terminated,
        }
    }

    /// Queues a one-shot job. Hands the job back if the timer no longer accepts work.
    pub(crate) fn schedule_once(&self, job: OnceJob, delay: Duration) -> Result<(), OnceJob> {
        let mut queue = self.queue.lock();
        if queue.shutting_down {
            return Err(job);
        }
        Self::push(
            &mut queue,
            deadline_after(Instant::now(), delay),
            ScheduledJob::Once(job),
        );
        self.wakeup.notify_one();
        Ok(())
    }

    /// Queues a repeating job. Hands the job back if the timer no longer accepts work.
    pub(crate) fn schedule_repeating(
        &self,
        job: RepeatingJob,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<(), RepeatingJob> {
        let mut queue = self.queue.lock();
        if queue.shutting_down {
            return Err(job);
        }
        Self::push(
            &mut queue,
            deadline_after(Instant::now(), initial_delay),
            ScheduledJob::Repeating { job, period },
        );
        self.wakeup.notify_one();
        Ok(())
    }

    /// Stops accepting work and discards repeating jobs.
    pub(crate) fn begin_shutdown(&self) {
        let mut queue = self.queue.lock();
        queue.shutting_down = true;
        let remaining = std::mem::take(&mut queue.entries);
        queue.entries = remaining
            .into_iter()
            .filter(|entry| matches!(entry.job, ScheduledJob::Once(_)))
            .collect();
        self.wakeup.notify_all();
    }

    /// Wakes the scheduler so it can observe forced termination.
    pub(crate) fn wake(&self) {
        self.wakeup.notify_all();
    }

    fn push(queue: &mut TimerQueue, deadline: Instant, job: ScheduledJob) {
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.entries.push(ScheduledEntry {
            deadline,
            sequence,
            job,
        });
    }

    /// Blocks until the next job is due. Returns `None` when the thread should exit.
    fn next_due(&self) -> Option<ScheduledEntry> {
        let mut queue = self.queue.lock();
        loop {
            if self.terminated.load(AtomicOrdering::Acquire) {
                queue.entries.clear();
                return None;
            }

            let next_deadline = queue.entries.peek().map(|entry| entry.deadline);
            match next_deadline {
                None if queue.shutting_down => return None,
                None => self.wakeup.wait(&mut queue),
                Some(deadline) if deadline <= Instant::now() => return queue.entries.pop(),
                Some(deadline) => {
                    self.wakeup.wait_until(&mut queue, deadline);
                }
            }
        }
    }

    /// The scheduler thread's body.
    pub(crate) fn run(&self, thread_name: &str) {
        let _exit = SchedulerExitGuard(self);
        while let Some(entry) = self.next_due() {
            match entry.job {
                ScheduledJob::Once(job) => job(),
                ScheduledJob::Repeating { mut job, period } => {
                    job();
                    let mut queue = self.queue.lock();
                    if !queue.shutting_down {
                        // Fixed rate: the next run is anchored on the previous deadline,
                        // not on when this run finished.
                        Self::push(
                            &mut queue,
                            deadline_after(entry.deadline, period),
                            ScheduledJob::Repeating { job, period },
                        );
                    }
                }
            }
        }
        debug!("{} exiting", thread_name);
    }
}

/// Closes the timer when the scheduler thread exits, panicking or not, so later
/// submissions are handed back to run inline and queued jobs fail their handles.
struct SchedulerExitGuard<'a>(&'a TimerShared);

impl Drop for SchedulerExitGuard<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut queue = self.0.queue.lock();
            queue.shutting_down = true;
            std::mem::take(&mut queue.entries)
        };
        drop(abandoned);
    }
}
