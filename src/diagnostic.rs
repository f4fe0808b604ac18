//! Structured diagnostics delivered to a caller-supplied sink.

use derive_more::Display;
use parking_lot::Mutex;
use std::sync::Arc;

/// Source position reconstructed from the container's location table.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
#[display("{filename}:{line}:{column}")]
pub struct Location {
    pub filename: Arc<str>,
    pub line: u32,
    pub column: u32,
}

/// An informational or error message with an optional location.
///
/// Diagnostics never drive control flow; they are handed to the sink and the
/// engine carries on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }
}

impl core::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Sink receiving every diagnostic emitted while opening or running a program.
pub type DiagnosticHandler = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Handler that silently drops every diagnostic.
#[must_use]
pub fn ignore_diagnostics() -> DiagnosticHandler {
    Arc::new(|_| {})
}

/// Thread-safe sink that records diagnostics for later inspection.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticCollector {
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that appends into this collector.
    #[must_use]
    pub fn handler(&self) -> DiagnosticHandler {
        let diagnostics = Arc::clone(&self.diagnostics);
        Arc::new(move |diag| diagnostics.lock().push(diag.clone()))
    }

    /// Drain everything collected so far.
    pub fn take(&self) -> Vec<Diagnostic> {
        core::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn len(&self) -> usize {
        self.diagnostics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
