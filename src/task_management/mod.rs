//! # Task Management System
//!
//! This module provides named asynchronous execution contexts used to keep disk I/O
//! off the game-logic threads.
//!
//! ## Architecture Overview
//!
//! - `AsyncTaskContext`: a named pool of worker threads fed by a bounded queue, plus
//!   one scheduler thread for delayed and fixed-rate jobs
//! - `TaskHandle`: the submitter's view of a task's eventual result
//! - `TaskContextRegistry`: lazily creates one context per logical name and shuts them
//!   all down together
//!
//! ## Degrade-to-synchronous
//!
//! Work is never dropped at submission time. If a context is not running, its queue
//! is full, or its threads could not be spawned, the task runs on the submitting
//! thread instead. Callers in that degraded state block for the duration of the task.
//!
//! ## Task Lifecycle
//! 1. A closure is submitted via `submit`, `run_async`, `schedule` or
//!    `schedule_at_fixed_rate`
//! 2. It runs on a worker (or the scheduler thread, or inline as a fallback)
//! 3. Its `anyhow::Result`, or a captured panic, completes the returned `TaskHandle`
//! 4. `shutdown()` drains queued work within a grace period, then abandons the rest
//!
//! ## Example Usage
//! ```rust
//! use placement_ledger::task_management::{AsyncTaskContext, TaskContextSettings};
//! use std::time::Duration;
//!
//! let context = AsyncTaskContext::new("Example", TaskContextSettings::default());
//!
//! let saved = context.submit(|| Ok("saved"));
//! let delayed = context.schedule(|| Ok(5), Duration::from_millis(10));
//!
//! assert_eq!(saved.join().unwrap(), "saved");
//! assert_eq!(delayed.join().unwrap(), 5);
//! context.shutdown();
//! ```

pub mod registry;
pub mod task;
mod timer;

pub use registry::TaskContextRegistry;
pub use task::TaskHandle;

use anyhow::anyhow;
use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use task::{deadline_after, panic_message, task_pair};
use timer::{OnceJob, RepeatingJob, TimerShared};
use web_time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sizing and shutdown behaviour shared by every context a registry creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskContextSettings {
    /// Number of worker threads per context.
    pub workers: usize,
    /// Maximum number of queued jobs before submissions fall back to the caller.
    pub queue_capacity: usize,
    /// How long `shutdown` waits for queued work before abandoning it.
    pub shutdown_grace_millis: u64,
}

impl Default for TaskContextSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 4096,
            shutdown_grace_millis: 5_000,
        }
    }
}

impl TaskContextSettings {
    /// The shutdown grace period as a `Duration`.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }
}

/// Counts a context's live threads so `shutdown` can wait for them with a timeout.
#[derive(Default)]
struct LiveThreads {
    count: Mutex<usize>,
    exited: Condvar,
}

impl LiveThreads {
    fn thread_started(&self) {
        *self.count.lock() += 1;
    }

    fn thread_exited(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        self.exited.notify_all();
    }

    fn wait_all_exited(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut count = self.count.lock();
        while *count > 0 {
            if self.exited.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Decrements the live-thread count when a context thread exits, panicking or not.
struct ThreadExitGuard(Arc<LiveThreads>);

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        self.0.thread_exited();
    }
}

/// A named execution context: a bounded worker pool plus one scheduler thread.
///
/// # Implementation Notes
/// - Tasks return `anyhow::Result<T>`; panics are caught and reported as errors
/// - Submissions never fail: a context that cannot take the work runs it inline
/// - There is no cancellation; once accepted, a task runs to completion unless a
///   forced shutdown abandons it before it starts
pub struct AsyncTaskContext {
    name: String,
    running: AtomicBool,
    job_sender: Mutex<Option<Sender<Job>>>,
    timer: Option<Arc<TimerShared>>,
    live_threads: Arc<LiveThreads>,
    terminated: Arc<AtomicBool>,
    grace_period: Duration,
}

impl AsyncTaskContext {
    /// Creates a context and spawns its threads.
    ///
    /// Threads are named `<name>-Worker-<i>` and `<name>-Scheduler`. A thread that fails
    /// to spawn is logged and its side of the context degrades to inline execution.
    pub fn new(name: &str, settings: TaskContextSettings) -> Self {
        let terminated = Arc::new(AtomicBool::new(false));
        let live_threads = Arc::new(LiveThreads::default());

        let (sender, receiver) = bounded::<Job>(settings.queue_capacity.max(1));
        let mut spawned_workers = 0;
        for index in 0..settings.workers.max(1) {
            let receiver = receiver.clone();
            let terminated = terminated.clone();
            let exit_target = live_threads.clone();
            live_threads.thread_started();

            let spawned = thread::Builder::new()
                .name(format!("{}-Worker-{}", name, index))
                .spawn(move || {
                    let _exit = ThreadExitGuard(exit_target);
                    while let Ok(job) = receiver.recv() {
                        if terminated.load(Ordering::Acquire) {
                            break;
                        }
                        job();
                    }
                });

            match spawned {
                Ok(_) => spawned_workers += 1,
                Err(spawn_error) => {
                    live_threads.thread_exited();
                    error!("Failed to spawn worker {} for {}: {}", index, name, spawn_error);
                }
            }
        }

        let job_sender = if spawned_workers > 0 {
            Some(sender)
        } else {
            warn!("{} has no worker threads; tasks will run inline", name);
            None
        };

        let timer = Arc::new(TimerShared::new(terminated.clone()));
        let scheduler_name = format!("{}-Scheduler", name);
        let runner = timer.clone();
        let exit_target = live_threads.clone();
        let thread_name = scheduler_name.clone();
        live_threads.thread_started();
        let timer = match thread::Builder::new()
            .name(scheduler_name)
            .spawn(move || {
                let _exit = ThreadExitGuard(exit_target);
                runner.run(&thread_name);
            }) {
            Ok(_) => Some(timer),
            Err(spawn_error) => {
                live_threads.thread_exited();
                error!("Failed to spawn scheduler for {}: {}", name, spawn_error);
                None
            }
        };

        info!(
            "Task context {} started with {} worker(s)",
            name, spawned_workers
        );

        Self {
            name: name.to_string(),
            running: AtomicBool::new(true),
            job_sender: Mutex::new(job_sender),
            timer,
            live_threads,
            terminated,
            grace_period: settings.shutdown_grace(),
        }
    }

    /// The logical name this context was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the context still accepts work onto its own threads.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs `task` on the worker pool and returns a handle to its result.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (handle, completer) = task_pair();
        self.execute(Box::new(move || completer.complete(run_guarded(task))));
        handle
    }

    /// Runs a procedure on the worker pool. Convenience wrapper around [`submit`](Self::submit).
    pub fn run_async<F>(&self, procedure: F) -> TaskHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(move || {
            procedure();
            Ok(())
        })
    }

    /// Runs `task` once on the scheduler thread after `delay`.
    ///
    /// Falls back to running immediately on the caller when the scheduler is unavailable.
    pub fn schedule<T, F>(&self, task: F, delay: Duration) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (handle, completer) = task_pair();
        let job: OnceJob = Box::new(move || completer.complete(run_guarded(task)));

        match self.timer.as_ref().filter(|_| self.is_running()) {
            Some(timer) => {
                if let Err(job) = timer.schedule_once(job, delay) {
                    self.run_inline(job);
                }
            }
            None => self.run_inline(job),
        }
        handle
    }

    /// Runs `task` repeatedly on the scheduler thread, every `period` after
    /// `initial_delay`.
    ///
    /// The returned handle completes with the first run's outcome only. Later failures
    /// are logged and do not stop subsequent runs. When the scheduler is unavailable the
    /// task runs once, inline. A zero `period` is rejected and the task never runs.
    pub fn schedule_at_fixed_rate<T, F>(
        &self,
        mut task: F,
        initial_delay: Duration,
        period: Duration,
    ) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        let (handle, completer) = task_pair();
        if period.is_zero() {
            completer.complete(Err(anyhow!(
                "fixed-rate task on {} needs a non-zero period",
                self.name
            )));
            return handle;
        }

        let name = self.name.clone();
        let mut first_run = Some(completer);
        let job: RepeatingJob = Box::new(move || {
            let result = run_guarded(|| task());
            match first_run.take() {
                Some(completer) => completer.complete(result),
                None => {
                    if let Err(task_error) = result {
                        error!("Periodic task on {} failed: {:#}", name, task_error);
                    }
                }
            }
        });

        let rejected = match self.timer.as_ref().filter(|_| self.is_running()) {
            Some(timer) => timer
                .schedule_repeating(job, initial_delay, period)
                .err(),
            None => Some(job),
        };
        if let Some(mut job) = rejected {
            debug!("{} unavailable, running periodic task once inline", self.name);
            job();
        }
        handle
    }

    /// Stops the context.
    ///
    /// Marks it not-running, closes the worker queue, stops the scheduler from repeating
    /// jobs, then waits up to the grace period for queued work to drain. Work still
    /// pending after the grace period is abandoned and its handles resolve to errors.
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down task context {}", self.name);

        self.job_sender.lock().take();
        if let Some(timer) = &self.timer {
            timer.begin_shutdown();
        }

        if !self.live_threads.wait_all_exited(self.grace_period) {
            warn!(
                "Task context {} did not drain within {:?}; abandoning pending work",
                self.name, self.grace_period
            );
            self.terminated.store(true, Ordering::Release);
            if let Some(timer) = &self.timer {
                timer.wake();
            }
        }
    }

    fn execute(&self, job: Job) {
        if !self.is_running() {
            return self.run_inline(job);
        }

        let rejected = match self.job_sender.lock().as_ref() {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => None,
                Err(TrySendError::Full(job)) => {
                    warn!("{} queue is full", self.name);
                    Some(job)
                }
                Err(TrySendError::Disconnected(job)) => Some(job),
            },
            None => Some(job),
        };

        if let Some(job) = rejected {
            self.run_inline(job);
        }
    }

    fn run_inline(&self, job: Job) {
        debug!("{} unavailable, running task on the calling thread", self.name);
        job();
    }
}

impl Drop for AsyncTaskContext {
    fn drop(&mut self) {
        // Let the threads wind down on their own; nothing can wait on them any more.
        if self.running.swap(false, Ordering::AcqRel) {
            self.job_sender.lock().take();
            if let Some(timer) = &self.timer {
                timer.begin_shutdown();
            }
        }
    }
}

fn run_guarded<T>(task: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("task panicked: {}", panic_message(payload.as_ref()))),
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
