//! Pluggable task queues.
//!
//! A task queue accepts independent work units (kernel dispatches and
//! continuations) and guarantees that each eventually runs, with no ordering
//! between unrelated units. The engine behaves identically under every
//! implementation.
//!
//! - `ThreadPoolWorkQueue` with zero workers (`s`): fully synchronous, tasks
//!   run on the thread calling `await_values` or `quiesce`.
//! - `ThreadPoolWorkQueue` with N workers (`mstd:N`): one shared FIFO drained
//!   by std threads; blocked callers help drain it.
//! - `WorkStealingWorkQueue` (`rayon:N`): rayon work-stealing pool.
//!
//! `await_values` and `quiesce` must not be called from inside a task. A
//! task that panics aborts the process under every queue.

mod blocking;
mod work_stealing;

pub use self::{blocking::ThreadPoolWorkQueue, work_stealing::WorkStealingWorkQueue};
use crate::{
    config::{ConfigError, WorkQueueKind},
    value::AsyncValueRef,
};
use core::fmt::Debug;

/// Unit of work accepted by a `WorkQueue`.
pub type TaskFunction = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling strategy for kernel dispatches and continuations.
pub trait WorkQueue: Debug + Send + Sync {
    /// Name used in diagnostics and driver output.
    fn name(&self) -> &str;

    /// Number of dedicated worker threads (zero for the synchronous queue).
    fn worker_threads(&self) -> usize;

    /// Schedule `task` to run eventually.
    fn add_task(&self, task: TaskFunction);

    /// Block until every value is resolved, running queued tasks on the
    /// calling thread if the implementation supports it.
    fn await_values(&self, values: &[AsyncValueRef]);

    /// Block until no task is queued or running.
    fn quiesce(&self);
}

/// Build the queue selected by `kind`.
///
/// # Errors
/// When the worker threads cannot be started.
pub fn create_work_queue(kind: WorkQueueKind) -> Result<Box<dyn WorkQueue>, ConfigError> {
    let queue: Box<dyn WorkQueue> = match kind {
        WorkQueueKind::SingleThreaded => Box::new(ThreadPoolWorkQueue::new(0)?),
        WorkQueueKind::ThreadPool { threads } => Box::new(ThreadPoolWorkQueue::new(threads.get())?),
        WorkQueueKind::WorkStealing { threads } => {
            Box::new(WorkStealingWorkQueue::new(threads.get())?)
        }
    };
    tracing::debug!(
        queue = queue.name(),
        workers = queue.worker_threads(),
        "work queue created"
    );
    Ok(queue)
}

fn all_available(values: &[AsyncValueRef]) -> bool {
    values.iter().all(|value| value.is_available())
}
