//! Typed callables and the execution protocol.

use crate::{
    allocator::AllocError,
    coordinator::Coordinator,
    kernel::NativeCallable,
    types::TypeName,
    value::AsyncValueRef,
};
use core::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Synchronous failure of `Function::execute`; nothing was scheduled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecuteError {
    #[error("function '{function}' expects {expected} arguments, got {actual}")]
    ArityMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("couldn't allocate execution state for function '{function}': {source}")]
    Allocation {
        function: String,
        #[source]
        source: AllocError,
    },
}

/// A callable with a fixed argument/result signature.
pub trait Function: Debug + Send + Sync {
    /// Function name; empty for anonymous functions.
    fn name(&self) -> &str;

    fn argument_types(&self) -> &[TypeName];

    fn result_types(&self) -> &[TypeName];

    /// Schedule an execution and return immediately.
    ///
    /// On success the returned vector holds exactly `result_types().len()`
    /// futures for the caller to await.
    ///
    /// # Errors
    /// When the argument count does not match the signature, or the
    /// execution state cannot be allocated.
    fn execute(
        &self,
        arguments: &[AsyncValueRef],
        coordinator: &Arc<Coordinator>,
    ) -> Result<Vec<AsyncValueRef>, ExecuteError>;
}

/// Name and type signature shared by every kind of function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: Arc<str>,
    pub argument_types: Vec<TypeName>,
    pub result_types: Vec<TypeName>,
}

impl FunctionSignature {
    pub(crate) fn check_arguments(&self, arguments: &[AsyncValueRef]) -> Result<(), ExecuteError> {
        if arguments.len() == self.argument_types.len() {
            Ok(())
        } else {
            Err(ExecuteError::ArityMismatch {
                function: self.name.to_string(),
                expected: self.argument_types.len(),
                actual: arguments.len(),
            })
        }
    }
}

/// Function implemented by a registered native callable.
#[derive(derive_more::Debug)]
pub struct NativeFunction {
    signature: FunctionSignature,
    #[debug(skip)]
    callable: NativeCallable,
}

impl NativeFunction {
    pub fn new(signature: FunctionSignature, callable: NativeCallable) -> Self {
        Self {
            signature,
            callable,
        }
    }
}

impl Function for NativeFunction {
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
        let results: Vec<_> = self
            .signature
            .result_types
            .iter()
            .map(|_| coordinator.make_unresolved())
            .collect();
        (self.callable)(arguments, &results, coordinator);
        Ok(results)
    }
}
