use super::{ProgramShared, setup::FunctionBody};
use crate::{
    allocator::HostArray,
    coordinator::Coordinator,
    error::AsyncError,
    function::{ExecuteError, FunctionSignature},
    kernel::KernelFrame,
    sync::{AtomicU32, Ordering, fence},
    types::SlotIndex,
    value::AsyncValueRef,
};
use std::sync::Arc;

/// Value table and pending-input counters of one execution.
///
/// Kept alive by the continuations registered on its unresolved slots and by
/// queued kernel tasks; dropped once the last of them has run.
#[derive(derive_more::Debug)]
struct ExecutionFrame {
    program: Arc<ProgramShared>,
    body: Arc<FunctionBody>,
    #[debug(skip)]
    coordinator: Arc<Coordinator>,
    slots: Vec<AsyncValueRef>,
    #[debug(skip)]
    pending: HostArray<AtomicU32>,
}

/// Build the value table, wire slot continuations and dispatch the roots.
pub(super) fn start(
    signature: &FunctionSignature,
    program: &Arc<ProgramShared>,
    body: &Arc<FunctionBody>,
    arguments: &[AsyncValueRef],
    coordinator: &Arc<Coordinator>,
) -> Result<Vec<AsyncValueRef>, ExecuteError> {
    let slots: Vec<_> = arguments
        .iter()
        .cloned()
        .chain((arguments.len()..body.num_slots).map(|_| coordinator.make_unresolved()))
        .collect();
    let pending = HostArray::from_fn(coordinator.allocator(), body.kernels.len(), |idx| {
        AtomicU32::new(body.kernels[idx].num_inputs())
    })
    .map_err(|source| ExecuteError::Allocation {
        function: signature.name.to_string(),
        source,
    })?;
    let results = body
        .results
        .iter()
        .map(|&slot| Arc::clone(&slots[slot as usize]))
        .collect();

    let frame = Arc::new(ExecutionFrame {
        program: Arc::clone(program),
        body: Arc::clone(body),
        coordinator: Arc::clone(coordinator),
        slots,
        pending,
    });
    for slot in 0..body.num_slots {
        if body.users(slot).is_empty() {
            continue;
        }
        let waiter = Arc::clone(&frame);
        frame.slots[slot].and_then(move |_| waiter.on_slot_resolved(slot));
    }
    for &kernel in &body.roots {
        frame.dispatch(kernel);
    }
    Ok(results)
}

impl ExecutionFrame {
    /// Publish the resolution of `slot` to the kernels reading it.
    ///
    /// A Release fence precedes the Relaxed decrements; whoever brings a
    /// counter to zero issues an Acquire fence before dispatching, so the
    /// kernel observes every input written by the other resolving threads.
    fn on_slot_resolved(self: &Arc<Self>, slot: usize) {
        fence(Ordering::Release);
        for &kernel in self.body.users(slot) {
            let previous = self.pending[kernel as usize].fetch_sub(1, Ordering::Relaxed);
            assert_ne!(previous, 0, "ExecutionFrame::on_slot_resolved: [1]");
            if previous == 1 {
                fence(Ordering::Acquire);
                self.dispatch(kernel);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, kernel: u32) {
        let frame = Arc::clone(self);
        self.coordinator
            .enqueue_work(move || frame.run_kernel(kernel as usize));
    }

    fn fail_outputs(&self, outputs: &[SlotIndex], error: &AsyncError) {
        for &slot in outputs {
            self.slots[slot as usize].set_error(error.clone());
        }
    }

    fn run_kernel(&self, idx: usize) {
        let entry = &self.body.kernels[idx];
        let program = &*self.program;
        let name = &program.kernel_names[entry.kernel as usize];
        let location = program.location(entry.location);
        let inputs = self.body.inputs(entry);
        let outputs = self.body.outputs(entry);

        if self.coordinator.is_cancelled() {
            tracing::trace!(kernel = %name, "kernel skipped after cancellation");
            self.fail_outputs(outputs, &AsyncError::cancelled());
            return;
        }
        if let Some(error) = inputs
            .iter()
            .find_map(|&slot| self.slots[slot as usize].error_if_present())
        {
            tracing::trace!(kernel = %name, %error, "error input short-circuits kernel");
            self.fail_outputs(outputs, error);
            return;
        }
        let Some(implementation) = &program.kernels[entry.kernel as usize] else {
            let error = AsyncError::new(format!("unknown kernel '{name}'"))
                .with_location(location.cloned());
            self.fail_outputs(outputs, &error);
            return;
        };

        tracing::trace!(kernel = %name, "dispatching kernel");
        let mut frame = KernelFrame::new(
            name,
            &self.slots,
            inputs,
            outputs,
            &entry.attributes,
            &program.buffer,
            &program.types,
            location,
            &self.coordinator,
        );
        implementation(&mut frame);
        frame.finish();
    }
}
