use super::{TaskFunction, WorkQueue, all_available};
use crate::{config::ConfigError, value::AsyncValueRef};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{collections::VecDeque, sync::Arc, thread::JoinHandle};

/// Shared FIFO drained by a fixed set of std threads.
///
/// With zero workers the queue is fully synchronous: nothing runs until a
/// caller blocks in `await_values` or `quiesce`, which then drains the queue
/// on its own thread. With workers, blocked callers still help drain the
/// queue so a saturated pool cannot starve them.
///
/// A task that panics aborts the process, wherever it runs.
#[derive(Debug)]
pub struct ThreadPoolWorkQueue {
    name: String,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    changed: Condvar,
}

#[derive(derive_more::Debug, Default)]
struct QueueState {
    #[debug(skip)]
    tasks: VecDeque<TaskFunction>,
    /// Queued plus running tasks.
    in_flight: usize,
    shutdown: bool,
}

/// Aborts the process if a task unwinds.
///
/// A panicking task leaves its results unresolved and its `in_flight` slot
/// taken, so nobody waiting on the queue could ever wake up.
struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("task panicked, aborting");
            std::process::abort();
        }
    }
}

fn run_task(task: TaskFunction) {
    let _abort = AbortOnUnwind;
    task();
}

impl Shared {
    fn notify(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    fn finish_task(&self, state: &mut MutexGuard<'_, QueueState>) {
        state.in_flight = state
            .in_flight
            .checked_sub(1)
            .expect("ThreadPoolWorkQueue::finish_task: [1]");
        if state.in_flight == 0 {
            self.changed.notify_all();
        }
    }

    /// Run queued tasks on the calling thread until `done` holds.
    fn help_until(&self, mut done: impl FnMut(&QueueState) -> bool) {
        let mut state = self.state.lock();
        loop {
            if done(&state) {
                return;
            }
            if let Some(task) = state.tasks.pop_front() {
                MutexGuard::unlocked(&mut state, || run_task(task));
                self.finish_task(&mut state);
                continue;
            }
            self.changed.wait(&mut state);
        }
    }

    fn worker_loop(&self) {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                MutexGuard::unlocked(&mut state, || run_task(task));
                self.finish_task(&mut state);
                continue;
            }
            if state.shutdown {
                return;
            }
            self.changed.wait(&mut state);
        }
    }
}

impl ThreadPoolWorkQueue {
    /// Start a queue with `num_threads` workers (zero for synchronous mode).
    ///
    /// # Errors
    /// When a worker thread cannot be spawned.
    pub fn new(num_threads: usize) -> Result<Self, ConfigError> {
        let name = if num_threads == 0 {
            "single-threaded".to_owned()
        } else {
            format!("thread-pool:{num_threads}")
        };
        let shared = Arc::new(Shared::default());
        let mut queue = Self {
            name,
            shared,
            workers: Vec::with_capacity(num_threads),
        };
        for idx in 0..num_threads {
            let shared = Arc::clone(&queue.shared);
            let worker = std::thread::Builder::new()
                .name(format!("cdr-worker-{idx}"))
                .spawn(move || shared.worker_loop())
                .map_err(|err| ConfigError::WorkQueueStartup {
                    name: queue.name.clone(),
                    reason: err.to_string(),
                })?;
            queue.workers.push(worker);
        }
        Ok(queue)
    }
}

impl WorkQueue for ThreadPoolWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_threads(&self) -> usize {
        self.workers.len()
    }

    fn add_task(&self, task: TaskFunction) {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(task);
        state.in_flight += 1;
        self.shared.changed.notify_all();
    }

    fn await_values(&self, values: &[AsyncValueRef]) {
        for value in values {
            let shared = Arc::clone(&self.shared);
            value.and_then(move |_| shared.notify());
        }
        self.shared.help_until(|_| all_available(values));
    }

    fn quiesce(&self) {
        self.shared.help_until(|state| state.in_flight == 0);
    }
}

impl Drop for ThreadPoolWorkQueue {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_all();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // The last reference may be released by a task on one of our own
            // workers; that thread exits on its own once it sees `shutdown`.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!(queue = %self.name, "worker thread panicked");
            }
        }
    }
}
