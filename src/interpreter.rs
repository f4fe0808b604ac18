//! Loading and interpreting binary programs.
//!
//! `Program::open` decodes a container, validates every function body and
//! resolves kernel names against a registry once. Each call to
//! `Function::execute` on an interpreted function then builds a fresh value
//! table and drives the kernels in dependency order:
//! - one future cell per slot; argument slots share the caller's cells,
//! - one pending-input counter per kernel, allocated through the
//!   coordinator's allocator,
//! - a kernel is enqueued once its counter drops to zero, zero-input kernels
//!   at start.
//!
//! Resolution of a slot decrements the counters of its users under a
//! Release/Relaxed/Acquire fence protocol, so a dispatched kernel observes
//! every input's payload.

mod execute;
mod setup;

use self::setup::FunctionBody;
use crate::{
    coordinator::Coordinator,
    diagnostic::{Diagnostic, DiagnosticHandler, Location},
    format::{Container, ParseError, ParseErrorKind},
    function::{ExecuteError, Function, FunctionSignature, NativeFunction},
    kernel::KernelImplementation,
    registry::KernelRegistry,
    types::{HashMap, TypeName},
    value::AsyncValueRef,
};
use std::sync::Arc;

/// State shared by every function of one program.
#[derive(derive_more::Debug)]
pub(crate) struct ProgramShared {
    #[debug(skip)]
    buffer: Arc<[u8]>,
    types: Vec<TypeName>,
    kernel_names: Vec<Arc<str>>,
    /// Registry lookups done at open; `None` for unknown kernels.
    #[debug(skip)]
    kernels: Vec<Option<KernelImplementation>>,
    locations: Vec<Location>,
}

impl ProgramShared {
    fn location(&self, idx: Option<u32>) -> Option<&Location> {
        idx.map(|idx| &self.locations[idx as usize])
    }
}

/// A parsed, validated program.
#[derive(Debug)]
pub struct Program {
    functions: Vec<Arc<dyn Function>>,
    by_name: HashMap<Arc<str>, usize>,
}

impl Program {
    /// Parse and validate `buffer`, resolving kernels and native functions
    /// against `registry`.
    ///
    /// Kernels missing from the registry are not an error here: their
    /// invocations resolve every output to an error at run time.
    ///
    /// # Errors
    /// When the container is malformed; the error is also reported to
    /// `diagnostics`, with the offending kernel's location when known.
    pub fn open(
        buffer: impl Into<Arc<[u8]>>,
        registry: &KernelRegistry,
        diagnostics: &DiagnosticHandler,
    ) -> Result<Self, ParseError> {
        let buffer = buffer.into();
        Self::open_impl(buffer, registry).inspect_err(|err| {
            diagnostics(&Diagnostic::new(err.to_string()).with_location(err.location.clone()));
        })
    }

    fn open_impl(buffer: Arc<[u8]>, registry: &KernelRegistry) -> Result<Self, ParseError> {
        let Container {
            types,
            kernel_names,
            locations,
            functions: records,
        } = Container::parse(&buffer)?;
        let kernels = kernel_names
            .iter()
            .map(|name| registry.get_kernel(name))
            .collect();
        let shared = Arc::new(ProgramShared {
            buffer,
            types,
            kernel_names,
            kernels,
            locations,
        });

        let mut functions: Vec<Arc<dyn Function>> = Vec::with_capacity(records.len());
        let mut by_name = HashMap::default();
        for record in records {
            let signature = FunctionSignature {
                name: record.name,
                argument_types: record.argument_types,
                result_types: record.result_types,
            };
            let function: Arc<dyn Function> = match record.body {
                Some(body) => {
                    let body = FunctionBody::build(&signature, body, &shared.locations)?;
                    Arc::new(BinaryFunction {
                        signature,
                        program: Arc::clone(&shared),
                        body: Arc::new(body),
                    })
                }
                None => {
                    let callable = registry.get_native_function(&signature.name).ok_or_else(
                        || ParseErrorKind::UnknownNativeFunction(signature.name.to_string()),
                    )?;
                    Arc::new(NativeFunction::new(signature, callable))
                }
            };
            let name: Arc<str> = function.name().into();
            if !name.is_empty() && by_name.insert(name, functions.len()).is_some() {
                return Err(ParseErrorKind::DuplicateFunction(function.name().to_owned()).into());
            }
            functions.push(function);
        }
        tracing::debug!(functions = functions.len(), "program opened");
        Ok(Self { functions, by_name })
    }

    /// Named function, if present. Anonymous functions are never found.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Arc<dyn Function>> {
        if name.is_empty() {
            return None;
        }
        self.by_name.get(name).map(|&idx| &self.functions[idx])
    }

    /// Every function in container order, anonymous ones included.
    #[must_use]
    pub fn functions(&self) -> &[Arc<dyn Function>] {
        &self.functions
    }
}

/// Interpreted function backed by a program buffer.
#[derive(Debug)]
pub struct BinaryFunction {
    signature: FunctionSignature,
    program: Arc<ProgramShared>,
    body: Arc<FunctionBody>,
}

impl Function for BinaryFunction {
    fn name(&self) -> &str {
        &self.signature.name
    }

    fn argument_types(&self) -> &[TypeName] {
        &self.signature.argument_types
    }

    fn result_types(&self) -> &[TypeName] {
        &self.signature.result_types
    }

    fn execute(
        &self,
        arguments: &[AsyncValueRef],
        coordinator: &Arc<Coordinator>,
    ) -> Result<Vec<AsyncValueRef>, ExecuteError> {
        self.signature.check_arguments(arguments)?;
        tracing::debug!(function = %self.signature.name, "execution started");
        execute::start(
            &self.signature,
            &self.program,
            &self.body,
            arguments,
            coordinator,
        )
    }
}
