//! Errors carried by future cells.

use crate::diagnostic::Location;
use std::sync::Arc;
use thiserror::Error;

/// Why a future cell resolved to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AsyncErrorKind {
    /// A kernel failed, was missing, or received an error input.
    Kernel,
    /// The coordinator was cancelled before the producing kernel started.
    Cancelled,
}

/// Runtime error stored in a future cell.
///
/// Cheap to clone: the same error is shared by every output it is forwarded
/// to along the dependency edges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AsyncError {
    kind: AsyncErrorKind,
    message: Arc<str>,
    location: Option<Location>,
}

impl AsyncError {
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            kind: AsyncErrorKind::Kernel,
            message: message.into(),
            location: None,
        }
    }

    /// The error every pending result resolves to after `Coordinator::cancel`.
    pub fn cancelled() -> Self {
        Self {
            kind: AsyncErrorKind::Cancelled,
            message: "cancelled".into(),
            location: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    #[must_use]
    pub fn kind(&self) -> AsyncErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == AsyncErrorKind::Cancelled
    }
}
