use crate::{
    allocator::{AllocError, HostAllocator, HostBuffer},
    diagnostic::{Diagnostic, DiagnosticHandler},
    error::AsyncError,
    registry::KernelRegistry,
    value::{AsyncValue, AsyncValueRef, ValueTracker},
    work_queue::WorkQueue,
};
use core::{
    any::Any,
    sync::atomic::{AtomicBool, Ordering},
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Bundles everything a program execution needs: allocator, kernel registry,
/// diagnostic sink and task queue.
///
/// Also owns the cancellation signal and the counter of live future cells it
/// created. A coordinator is created once per run and reused across function
/// executions; the driving discipline between two executions is
/// `await_values` → `quiesce` → `restart`.
#[derive(derive_more::Debug)]
pub struct Coordinator {
    #[debug(skip)]
    diagnostic_handler: DiagnosticHandler,
    allocator: Arc<dyn HostAllocator>,
    registry: KernelRegistry,
    work_queue: Box<dyn WorkQueue>,
    cancelled: AtomicBool,
    cancel_value: Mutex<Option<AsyncValueRef>>,
    values: Arc<ValueTracker>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        diagnostic_handler: DiagnosticHandler,
        allocator: Arc<dyn HostAllocator>,
        work_queue: Box<dyn WorkQueue>,
    ) -> Arc<Self> {
        tracing::debug!(work_queue = work_queue.name(), "coordinator created");
        Arc::new(Self {
            diagnostic_handler,
            allocator,
            registry: KernelRegistry::new(),
            work_queue,
            cancelled: AtomicBool::new(false),
            cancel_value: Mutex::new(None),
            values: Arc::default(),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<dyn HostAllocator> {
        &self.allocator
    }

    #[must_use]
    pub fn work_queue(&self) -> &dyn WorkQueue {
        &*self.work_queue
    }

    pub fn emit_diagnostic(&self, diagnostic: &Diagnostic) {
        (self.diagnostic_handler)(diagnostic);
    }

    /// Allocate zeroed host memory through the coordinator's allocator.
    ///
    /// # Errors
    /// When the allocator cannot satisfy the request.
    pub fn allocate_buffer(&self, size: usize, align: usize) -> Result<HostBuffer, AllocError> {
        HostBuffer::new(&self.allocator, size, align)
    }

    /// New unresolved cell counted by this coordinator.
    #[must_use]
    pub fn make_unresolved(&self) -> AsyncValueRef {
        AsyncValue::tracked(&self.values)
    }

    #[must_use]
    pub fn make_available<T: Any + Send + Sync>(&self, value: T) -> AsyncValueRef {
        let cell = self.make_unresolved();
        cell.set_value(value);
        cell
    }

    #[must_use]
    pub fn make_error(&self, error: AsyncError) -> AsyncValueRef {
        let cell = self.make_unresolved();
        cell.set_error(error);
        cell
    }

    /// Number of cells created through this coordinator that are still alive.
    ///
    /// Advisory only: consult it between fully quiesced runs.
    #[must_use]
    pub fn outstanding_values(&self) -> usize {
        self.values.live()
    }

    /// Schedule `work` on the task queue.
    pub fn enqueue_work(&self, work: impl FnOnce() + Send + 'static) {
        self.work_queue.add_task(Box::new(work));
    }

    /// Block until every value in `values` is resolved.
    ///
    /// Must be called from outside the task queue.
    pub fn await_values(&self, values: &[AsyncValueRef]) {
        self.work_queue.await_values(values);
    }

    /// Block until no work at all is outstanding.
    ///
    /// Must be called from outside the task queue.
    pub fn quiesce(&self) {
        self.work_queue.quiesce();
    }

    /// Request cooperative cancellation.
    ///
    /// Kernels already running finish; kernels not yet started resolve their
    /// results to a cancellation error instead of running.
    pub fn cancel(&self) {
        let mut cancel_value = self.cancel_value.lock();
        if cancel_value.is_none() {
            *cancel_value = Some(AsyncValue::error(AsyncError::cancelled()));
        }
        self.cancelled.store(true, Ordering::Release);
        tracing::info!("coordinator cancelled");
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Broadcast cell resolved to the cancellation error while cancelled.
    ///
    /// Long-running kernels may register a continuation on it to stop early.
    #[must_use]
    pub fn cancel_value(&self) -> Option<AsyncValueRef> {
        self.cancel_value.lock().clone()
    }

    /// Clear the cancellation signal, keeping allocator, registry and queue.
    ///
    /// Quiesce first so no kernel of the cancelled run is still in flight.
    pub fn restart(&self) {
        let mut cancel_value = self.cancel_value.lock();
        *cancel_value = None;
        self.cancelled.store(false, Ordering::Release);
    }
}
