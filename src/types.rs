use crate::sync::UnsafeCell;
use derive_more::{Deref, DerefMut, Display};
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;
use std::{collections::HashMap as _HashMap, sync::Arc};

/// A minimal `UnsafeCell` wrapper that is `Sync` when `T: Sync`.
///
/// Used by the future cell to publish its payload exactly once: the single
/// writer stores the payload before a Release store of the state, and readers
/// only dereference it after an Acquire load observes the resolved state.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct SyncUnsafeCell<T>(UnsafeCell<T>);

unsafe impl<T: Sync> Sync for SyncUnsafeCell<T> {}

impl<T> SyncUnsafeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}

/// Index of a value slot inside a function's value table.
pub type SlotIndex = u32;

/// Name of a value type as recorded in the container's type table (`i32`,
/// `f64`, `!chain`, ...).
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0}")]
pub struct TypeName(Arc<str>);

impl TypeName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
