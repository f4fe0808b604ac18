//! Asynchronous dataflow runtime for precompiled kernel programs.
//!
//! A program is a binary container of functions. Each interpreted function is
//! a flat list of kernel invocations reading and writing numbered value
//! slots. Executing a function creates one future cell per slot and runs each
//! kernel as soon as all of its inputs are resolved, on a pluggable task
//! queue. Errors travel along dependency edges only: a kernel with an error
//! input does not run and forwards the error to its outputs.
//!
//! Key modules:
//! - `value`: the future cell (`AsyncValue`), resolved exactly once with a
//!   value or an error, with continuations.
//! - `coordinator`: allocator, kernel registry, diagnostic sink, task queue
//!   and cancellation shared by every execution.
//! - `work_queue`: the `WorkQueue` trait and its implementations.
//! - `format`: container layout, parser views and `ProgramWriter`.
//! - `interpreter`: `Program::open` and dependency-driven execution.
//! - `kernel` and `registry`: the native kernel contract and the name →
//!   implementation table, extensible by dynamic libraries.
//! - `driver`: the reference runner behind the `cdr-run` binary.
//!
//! Quick start:
//! 1. Build a `Coordinator` with an allocator and a work queue.
//! 2. Register kernels (`kernels::register_builtin_kernels` and your own).
//! 3. `Program::open` the container, look a function up and `execute` it.
//! 4. `await_values` on the results, then `quiesce` before reusing the
//!    coordinator.

pub mod allocator;
pub mod config;
/// Execution context shared by all function executions of a run.
pub mod coordinator;
pub mod diagnostic;
pub mod driver;
pub mod error;
/// Binary container format.
pub mod format;
pub mod function;
pub mod interpreter;
/// Native kernel contract.
pub mod kernel;
pub mod kernels;
pub mod registry;
mod sync;
pub mod types;
/// Future cells.
pub mod value;
pub mod work_queue;

pub use crate::{
    coordinator::Coordinator,
    diagnostic::{Diagnostic, Location},
    error::AsyncError,
    function::Function,
    interpreter::Program,
    kernel::KernelFrame,
    registry::KernelRegistry,
    value::{AsyncValue, AsyncValueRef},
};
