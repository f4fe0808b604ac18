use crate::{error::AsyncError, sync::*, types::SyncUnsafeCell};
use core::{
    any::Any,
    fmt,
    sync::atomic::{AtomicUsize, Ordering as CounterOrdering},
};
use std::sync::{Arc, PoisonError};

/// Shared handle to a future cell.
pub type AsyncValueRef = Arc<AsyncValue>;

type Waiter = Box<dyn FnOnce(&AsyncValue) + Send>;

const UNRESOLVED: u8 = 0;
const AVAILABLE: u8 = 1;

/// Number of `AsyncValue`s alive in the whole process.
static LIVE_INSTANCES: AtomicUsize = AtomicUsize::new(0);

/// Resolved content of a future cell.
///
/// Values sit behind an `Arc` so that forwarding a resolved cell into another
/// one shares the payload instead of copying it.
#[derive(Clone)]
pub(crate) enum Payload {
    Value(Arc<dyn Any + Send + Sync>),
    Error(AsyncError),
}

/// Live-instance counter owned by a coordinator.
///
/// Cells created through a coordinator bump it on creation and drop it on
/// destruction, so a coordinator can detect leaks of its own cells regardless
/// of what other coordinators in the process are doing.
#[derive(Debug, Default)]
pub(crate) struct ValueTracker {
    live: AtomicUsize,
}

impl ValueTracker {
    pub(crate) fn live(&self) -> usize {
        self.live.load(CounterOrdering::Acquire)
    }
}

/// Single-assignment, reference-counted placeholder for a value or an error.
///
/// A cell starts unresolved and is resolved exactly once, either with a value
/// (`set_value`) or an error (`set_error`). Resolution runs every continuation
/// registered through `and_then` exactly once, inline on the resolving thread,
/// in registration order. Continuations registered afterwards run immediately.
///
/// Resolving a cell twice is a violated invariant and panics.
pub struct AsyncValue {
    state: AtomicU8,
    payload: SyncUnsafeCell<Option<Payload>>,
    waiters: Mutex<Vec<Waiter>>,
    tracker: Option<Arc<ValueTracker>>,
}

impl AsyncValue {
    fn with_tracker(tracker: Option<Arc<ValueTracker>>) -> Self {
        LIVE_INSTANCES.fetch_add(1, CounterOrdering::Relaxed);
        if let Some(tracker) = &tracker {
            tracker.live.fetch_add(1, CounterOrdering::Relaxed);
        }
        Self {
            state: AtomicU8::new(UNRESOLVED),
            payload: SyncUnsafeCell::new(None),
            waiters: Mutex::new(Vec::new()),
            tracker,
        }
    }

    /// Create an unresolved cell that is only counted process-wide.
    #[must_use]
    pub fn unresolved() -> AsyncValueRef {
        Arc::new(Self::with_tracker(None))
    }

    pub(crate) fn tracked(tracker: &Arc<ValueTracker>) -> AsyncValueRef {
        Arc::new(Self::with_tracker(Some(Arc::clone(tracker))))
    }

    /// Create a cell already resolved with `value`.
    #[must_use]
    pub fn available<T: Any + Send + Sync>(value: T) -> AsyncValueRef {
        let cell = Self::unresolved();
        cell.set_value(value);
        cell
    }

    /// Create a cell already resolved with `error`.
    #[must_use]
    pub fn error(error: AsyncError) -> AsyncValueRef {
        let cell = Self::unresolved();
        cell.set_error(error);
        cell
    }

    /// Number of cells currently alive in the process.
    ///
    /// Advisory only: meaningful between fully quiesced runs.
    #[must_use]
    pub fn live_instances() -> usize {
        LIVE_INSTANCES.load(CounterOrdering::Acquire)
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.load(Ordering::Acquire) == AVAILABLE
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error_if_present().is_some()
    }

    /// The error this cell resolved to, if it is resolved with one.
    #[must_use]
    pub fn error_if_present(&self) -> Option<&AsyncError> {
        match self.payload()? {
            Payload::Error(error) => Some(error),
            Payload::Value(_) => None,
        }
    }

    /// Typed access to the resolved value.
    ///
    /// Returns `None` while unresolved, when resolved with an error, or when
    /// the value has a different type.
    #[must_use]
    pub fn get<T: Any>(&self) -> Option<&T> {
        match self.payload()? {
            Payload::Value(value) => value.downcast_ref::<T>(),
            Payload::Error(_) => None,
        }
    }

    /// Resolve with a value.
    ///
    /// # Panics
    /// If the cell is already resolved.
    pub fn set_value<T: Any + Send + Sync>(&self, value: T) {
        self.resolve(Payload::Value(Arc::new(value)));
    }

    /// Resolve with an error.
    ///
    /// # Panics
    /// If the cell is already resolved.
    pub fn set_error(&self, error: AsyncError) {
        self.resolve(Payload::Error(error));
    }

    /// Resolve with the payload of `source`, sharing it rather than copying.
    ///
    /// # Panics
    /// If `source` is unresolved or `self` is already resolved.
    pub fn forward_from(&self, source: &AsyncValue) {
        let payload = source
            .payload()
            .expect("AsyncValue::forward_from: source is unresolved")
            .clone();
        self.resolve(payload);
    }

    /// Register a continuation invoked once this cell is resolved.
    ///
    /// The continuation receives the resolved cell, so it never has to keep a
    /// strong reference to it. If the cell is already resolved the
    /// continuation runs immediately on the calling thread.
    pub fn and_then(&self, waiter: impl FnOnce(&AsyncValue) + Send + 'static) {
        if self.is_available() {
            waiter(self);
            return;
        }
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.load(Ordering::Acquire) == AVAILABLE {
            drop(waiters);
            waiter(self);
            return;
        }
        waiters.push(Box::new(waiter));
    }

    pub(crate) fn payload(&self) -> Option<&Payload> {
        if !self.is_available() {
            return None;
        }
        // SAFETY: the Acquire load above observed `AVAILABLE`, which is stored
        // with Release only after the payload is written; it is never written
        // again afterwards.
        unsafe { self.payload.get().with(|ptr| (*ptr).as_ref()) }
    }

    fn resolve(&self, payload: Payload) {
        let waiters = {
            let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
            assert_eq!(
                self.state.load(Ordering::Relaxed),
                UNRESOLVED,
                "AsyncValue resolved twice"
            );
            // SAFETY: the state is still unresolved and the waiter lock is held,
            // so no reader dereferences the payload and no other writer exists.
            unsafe {
                self.payload.get_mut().with(|ptr| *ptr = Some(payload));
            }
            self.state.store(AVAILABLE, Ordering::Release);
            core::mem::take(&mut *waiters)
        };
        for waiter in waiters {
            waiter(self);
        }
    }
}

impl Drop for AsyncValue {
    fn drop(&mut self) {
        let previous = LIVE_INSTANCES.fetch_sub(1, CounterOrdering::Release);
        assert_ne!(previous, 0, "AsyncValue live-instance counter underflow");
        if let Some(tracker) = &self.tracker {
            let previous = tracker.live.fetch_sub(1, CounterOrdering::Release);
            assert_ne!(previous, 0, "coordinator value counter underflow");
        }
    }
}

impl fmt::Debug for AsyncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload() {
            None => f.write_str("AsyncValue(<unresolved>)"),
            Some(Payload::Value(_)) => f.write_str("AsyncValue(<value>)"),
            Some(Payload::Error(error)) => write!(f, "AsyncValue(<error: {error}>)"),
        }
    }
}
