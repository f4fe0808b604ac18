//! Name → kernel lookup, extensible by dynamically loaded libraries.

use crate::kernel::{KernelFrame, KernelImplementation, NativeCallable};
use crate::{coordinator::Coordinator, types::IndexMap, value::AsyncValueRef};
use libloading::Library;
use parking_lot::{Mutex, RwLock};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

/// Symbol an extension library exports to register its kernels.
pub const REGISTER_KERNELS_SYMBOL: &[u8] = b"cdr_register_kernels";

/// Signature of [`REGISTER_KERNELS_SYMBOL`].
pub type RegisterKernelsFn = unsafe extern "Rust" fn(&KernelRegistry);

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("couldn't load library {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
}

/// Registry of native kernels and native functions.
///
/// Read-mostly: lookups take a shared lock, registration an exclusive one.
#[derive(derive_more::Debug, Default)]
pub struct KernelRegistry {
    #[debug(skip)]
    kernels: RwLock<IndexMap<Arc<str>, KernelImplementation>>,
    #[debug(skip)]
    native_functions: RwLock<IndexMap<Arc<str>, NativeCallable>>,
    libraries: Mutex<Vec<Library>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` under `name`, replacing any previous registration.
    pub fn add_kernel(
        &self,
        name: impl Into<Arc<str>>,
        kernel: impl Fn(&mut KernelFrame<'_>) + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self.kernels.write().insert(Arc::clone(&name), Arc::new(kernel)).is_some() {
            tracing::warn!(kernel = %name, "kernel registered twice; keeping the latest");
        }
    }

    #[must_use]
    pub fn get_kernel(&self, name: &str) -> Option<KernelImplementation> {
        self.kernels.read().get(name).cloned()
    }

    /// Registered kernel names in registration order.
    #[must_use]
    pub fn kernel_names(&self) -> Vec<Arc<str>> {
        self.kernels.read().keys().cloned().collect()
    }

    /// Register a native function referenced from programs by `name`.
    pub fn add_native_function(
        &self,
        name: impl Into<Arc<str>>,
        callable: impl Fn(&[AsyncValueRef], &[AsyncValueRef], &Arc<Coordinator>) + Send + Sync + 'static,
    ) {
        let name = name.into();
        if self
            .native_functions
            .write()
            .insert(Arc::clone(&name), Arc::new(callable))
            .is_some()
        {
            tracing::warn!(function = %name, "native function registered twice; keeping the latest");
        }
    }

    #[must_use]
    pub fn get_native_function(&self, name: &str) -> Option<NativeCallable> {
        self.native_functions.read().get(name).cloned()
    }

    /// Load an extension library and run its registration entry point.
    ///
    /// Returns whether the library exported [`REGISTER_KERNELS_SYMBOL`];
    /// a library without it is loaded but registers nothing. The library
    /// stays loaded for the registry's lifetime.
    ///
    /// # Errors
    /// When the library cannot be loaded.
    pub fn load_extension(&self, path: &Path) -> Result<bool, ExtensionError> {
        // SAFETY: loading runs the library's initializers; extension
        // libraries are trusted the same way kernels are.
        let library = unsafe { Library::new(path) }.map_err(|source| ExtensionError::Load {
            path: path.to_owned(),
            source,
        })?;
        // SAFETY: the entry point is declared with `RegisterKernelsFn`'s
        // signature by contract.
        let entry = unsafe { library.get::<RegisterKernelsFn>(REGISTER_KERNELS_SYMBOL) }
            .ok()
            .map(|symbol| *symbol);
        let registered = match entry {
            Some(register) => {
                // SAFETY: see above; `library` outlives the call.
                unsafe { register(self) };
                true
            }
            None => false,
        };
        tracing::debug!(path = %path.display(), registered, "extension library loaded");
        self.libraries.lock().push(library);
        Ok(registered)
    }
}
