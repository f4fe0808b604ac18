//! Builtin kernels: constants, scalar addition and a few runtime utilities.

use crate::{
    error::AsyncError,
    format::Attribute,
    kernel::KernelFrame,
    registry::KernelRegistry,
};
use core::any::Any;

/// Register every builtin kernel into `registry`.
pub fn register_builtin_kernels(registry: &KernelRegistry) {
    registry.add_kernel("constant.i1", constant(|attr| attr.as_bool()));
    registry.add_kernel("constant.i32", constant(|attr| attr.as_i32()));
    registry.add_kernel("constant.i64", constant(|attr| attr.as_i64()));
    registry.add_kernel("constant.f32", constant(|attr| attr.as_f32()));
    registry.add_kernel("constant.f64", constant(|attr| attr.as_f64()));
    registry.add_kernel("add.i32", add(i32::wrapping_add));
    registry.add_kernel("add.i64", add(i64::wrapping_add));
    registry.add_kernel("add.f32", add(|a: f32, b| a + b));
    registry.add_kernel("add.f64", add(|a: f64, b| a + b));
    registry.add_kernel("error.report", report_error);
    registry.add_kernel("value.forward", forward);
    registry.add_kernel("coordinator.cancel", cancel);
    registry.add_kernel("host.alloc", host_alloc);
}

/// Report a shape error unless the invocation has exactly `arguments`
/// inputs and `results` outputs.
fn check_shape(frame: &mut KernelFrame<'_>, arguments: usize, results: usize) -> bool {
    if frame.num_arguments() == arguments && frame.num_results() == results {
        return true;
    }
    let message = format!(
        "kernel '{}' expects {arguments} arguments and {results} results, got {} and {}",
        frame.name(),
        frame.num_arguments(),
        frame.num_results()
    );
    frame.report_error(message);
    false
}

fn attribute<'a>(frame: &KernelFrame<'a>, idx: usize) -> Option<Attribute<'a>> {
    (idx < frame.num_attributes()).then(|| frame.attribute(idx))
}

fn constant<T: Any + Send + Sync>(
    decode: fn(Attribute<'_>) -> Option<T>,
) -> impl Fn(&mut KernelFrame<'_>) + Send + Sync + 'static {
    move |frame| {
        if !check_shape(frame, 0, 1) {
            return;
        }
        match attribute(frame, 0).and_then(decode) {
            Some(value) => frame.emplace_result(0, value),
            None => {
                let message = format!("kernel '{}' has no valid value attribute", frame.name());
                frame.report_error(message);
            }
        }
    }
}

fn add<T: Any + Send + Sync + Copy>(
    op: fn(T, T) -> T,
) -> impl Fn(&mut KernelFrame<'_>) + Send + Sync + 'static {
    move |frame| {
        if !check_shape(frame, 2, 1) {
            return;
        }
        let sum = frame
            .argument_as::<T>(0)
            .and_then(|&lhs| Ok(op(lhs, *frame.argument_as::<T>(1)?)));
        match sum {
            Ok(sum) => frame.emplace_result(0, sum),
            Err(error) => frame.report_error(error.message()),
        }
    }
}

/// Fail with the message in the first attribute. Inputs only order the
/// kernel after its producers.
fn report_error(frame: &mut KernelFrame<'_>) {
    let message = attribute(frame, 0)
        .and_then(Attribute::as_str)
        .unwrap_or("error.report")
        .to_owned();
    frame.report_error(message);
}

/// Forward argument `i` to result `i`.
fn forward(frame: &mut KernelFrame<'_>) {
    let count = frame.num_arguments();
    if !check_shape(frame, count, count) {
        return;
    }
    for idx in 0..count {
        let value = frame.argument(idx).clone();
        frame.forward_result(idx, value);
    }
}

/// Cancel the coordinator; every result resolves to the cancellation error.
fn cancel(frame: &mut KernelFrame<'_>) {
    frame.coordinator().cancel();
    for idx in 0..frame.num_results() {
        frame.set_result_error(idx, AsyncError::cancelled());
    }
}

/// Allocate a zeroed `HostBuffer` of `size` bytes (attribute 0) aligned to
/// `align` bytes (attribute 1, default 16).
fn host_alloc(frame: &mut KernelFrame<'_>) {
    if !check_shape(frame, 0, 1) {
        return;
    }
    let size = attribute(frame, 0)
        .and_then(Attribute::as_i64)
        .and_then(|size| usize::try_from(size).ok());
    let align = match attribute(frame, 1) {
        Some(align) => align.as_i64().and_then(|align| usize::try_from(align).ok()),
        None => Some(16),
    };
    let (Some(size), Some(align)) = (size, align) else {
        frame.report_error("host.alloc needs a non-negative size and alignment");
        return;
    };
    match frame.coordinator().allocate_buffer(size, align) {
        Ok(buffer) => frame.emplace_result(0, buffer),
        Err(err) => frame.report_error(err.to_string()),
    }
}
