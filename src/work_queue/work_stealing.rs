use super::{TaskFunction, WorkQueue, all_available};
use crate::{config::ConfigError, value::AsyncValueRef};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;

/// Work-stealing queue backed by a dedicated rayon pool.
///
/// Blocked callers cannot pull work out of rayon's deques, so they simply
/// wait; tasks never block, so the pool always makes progress.
#[derive(Debug)]
pub struct WorkStealingWorkQueue {
    name: String,
    pool: ThreadPool,
    tracker: Arc<InFlight>,
}

#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    changed: Condvar,
}

impl InFlight {
    fn notify(&self) {
        let _count = self.count.lock();
        self.changed.notify_all();
    }
}

/// Decrements the in-flight count even if the task unwinds.
struct FinishGuard(Arc<InFlight>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count = count.checked_sub(1).expect("WorkStealingWorkQueue: [1]");
        if *count == 0 {
            self.0.changed.notify_all();
        }
    }
}

impl WorkStealingWorkQueue {
    /// # Errors
    /// When rayon fails to start the pool.
    pub fn new(num_threads: usize) -> Result<Self, ConfigError> {
        let name = format!("rayon:{num_threads}");
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("cdr-rayon-{idx}"))
            .build()
            .map_err(|err| ConfigError::WorkQueueStartup {
                name: name.clone(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            name,
            pool,
            tracker: Arc::default(),
        })
    }
}

impl WorkQueue for WorkStealingWorkQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn add_task(&self, task: TaskFunction) {
        *self.tracker.count.lock() += 1;
        let guard = FinishGuard(Arc::clone(&self.tracker));
        self.pool.spawn(move || {
            let _guard = guard;
            task();
        });
    }

    fn await_values(&self, values: &[AsyncValueRef]) {
        for value in values {
            let tracker = Arc::clone(&self.tracker);
            value.and_then(move |_| tracker.notify());
        }
        let mut count = self.tracker.count.lock();
        while !all_available(values) {
            self.tracker.changed.wait(&mut count);
        }
    }

    fn quiesce(&self) {
        let mut count = self.tracker.count.lock();
        while *count != 0 {
            self.tracker.changed.wait(&mut count);
        }
    }
}
