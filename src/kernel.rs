use crate::{
    coordinator::Coordinator,
    diagnostic::{Diagnostic, Location},
    error::AsyncError,
    format::{Attribute, AttributeEntry},
    types::{SlotIndex, TypeName},
    value::AsyncValueRef,
};
use core::any::{Any, type_name};
use std::sync::Arc;

/// Native implementation of a kernel.
///
/// Invoked once every input of an invocation is resolved to a value. The
/// implementation must account for every output exactly once: resolve it
/// through `emplace_result`/`set_result_error`/`forward_result`, or claim it
/// with `take_async_result` and resolve it later.
pub type KernelImplementation = Arc<dyn Fn(&mut KernelFrame<'_>) + Send + Sync>;

/// Native implementation of a whole function.
///
/// Receives the arguments and one unresolved placeholder per result, each of
/// which it must eventually resolve.
pub type NativeCallable =
    Arc<dyn Fn(&[AsyncValueRef], &[AsyncValueRef], &Arc<Coordinator>) + Send + Sync>;

/// View of one kernel invocation handed to its implementation.
pub struct KernelFrame<'a> {
    name: &'a str,
    slots: &'a [AsyncValueRef],
    inputs: &'a [SlotIndex],
    outputs: &'a [SlotIndex],
    attributes: &'a [AttributeEntry],
    buffer: &'a [u8],
    types: &'a [TypeName],
    location: Option<&'a Location>,
    coordinator: &'a Arc<Coordinator>,
    claimed: Vec<usize>,
}

impl<'a> KernelFrame<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &'a str,
        slots: &'a [AsyncValueRef],
        inputs: &'a [SlotIndex],
        outputs: &'a [SlotIndex],
        attributes: &'a [AttributeEntry],
        buffer: &'a [u8],
        types: &'a [TypeName],
        location: Option<&'a Location>,
        coordinator: &'a Arc<Coordinator>,
    ) -> Self {
        Self {
            name,
            slots,
            inputs,
            outputs,
            attributes,
            buffer,
            types,
            location,
            coordinator,
            claimed: Vec::new(),
        }
    }

    /// Registered name of the running kernel.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name
    }

    #[must_use]
    pub fn location(&self) -> Option<&Location> {
        self.location
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        self.coordinator
    }

    #[must_use]
    pub fn num_arguments(&self) -> usize {
        self.inputs.len()
    }

    /// The resolved future feeding argument `idx`.
    #[must_use]
    pub fn argument(&self, idx: usize) -> &AsyncValueRef {
        &self.slots[self.inputs[idx] as usize]
    }

    /// Typed access to argument `idx`.
    ///
    /// # Errors
    /// When the argument holds a value of another type.
    pub fn argument_as<T: Any>(&self, idx: usize) -> Result<&T, AsyncError> {
        self.argument(idx).get::<T>().ok_or_else(|| {
            AsyncError::new(format!(
                "argument {idx} of kernel '{}' is not a {}",
                self.name,
                type_name::<T>()
            ))
        })
    }

    #[must_use]
    pub fn num_attributes(&self) -> usize {
        self.attributes.len()
    }

    /// Attribute `idx`, decoded straight from the program buffer.
    #[must_use]
    pub fn attribute(&self, idx: usize) -> Attribute<'a> {
        self.attributes[idx].decode(self.buffer, self.types)
    }

    #[must_use]
    pub fn num_results(&self) -> usize {
        self.outputs.len()
    }

    fn result(&self, idx: usize) -> &AsyncValueRef {
        &self.slots[self.outputs[idx] as usize]
    }

    /// Resolve result `idx` with `value`.
    pub fn emplace_result<T: Any + Send + Sync>(&mut self, idx: usize, value: T) {
        self.result(idx).set_value(value);
    }

    /// Resolve result `idx` with `error`.
    pub fn set_result_error(&mut self, idx: usize, error: AsyncError) {
        self.result(idx).set_error(error);
    }

    /// Make result `idx` resolve to whatever `value` resolves to, sharing
    /// its payload.
    pub fn forward_result(&mut self, idx: usize, value: AsyncValueRef) {
        let target = Arc::clone(self.result(idx));
        self.claimed.push(idx);
        value.and_then(move |resolved| target.forward_from(resolved));
    }

    /// Claim result `idx` for asynchronous resolution.
    ///
    /// The caller takes over the obligation to resolve the returned cell.
    pub fn take_async_result(&mut self, idx: usize) -> AsyncValueRef {
        self.claimed.push(idx);
        Arc::clone(self.result(idx))
    }

    /// Fail the invocation: emit a diagnostic at the kernel's location and
    /// resolve every result not yet resolved or claimed to the error.
    pub fn report_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        let location = self.location.cloned();
        self.coordinator
            .emit_diagnostic(&Diagnostic::new(message.clone()).with_location(location.clone()));
        let error = AsyncError::new(message).with_location(location);
        for idx in 0..self.outputs.len() {
            let cell = self.result(idx);
            if !cell.is_available() && !self.claimed.contains(&idx) {
                cell.set_error(error.clone());
            }
        }
    }

    /// Check that the implementation accounted for every result.
    ///
    /// # Panics
    /// If a result was neither resolved nor claimed.
    pub(crate) fn finish(self) {
        for idx in 0..self.outputs.len() {
            assert!(
                self.result(idx).is_available() || self.claimed.contains(&idx),
                "kernel '{}' did not produce result {idx}",
                self.name
            );
        }
    }
}
