//! Pluggable host memory allocators.
//!
//! Every allocator implements the same allocate/deallocate/report contract.
//! `SystemAllocator` forwards to the global allocator, `FixedSizeAllocator`
//! rounds every request up to whole blocks to shake out size mismatches in
//! tests, and `ProfiledAllocator`/`LeakCheckAllocator` decorate another
//! allocator with statistics or leak detection.

use crate::{config::AllocatorKind, types::HashMap};
use core::{
    alloc::Layout,
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Allocation failure reported by a `HostAllocator`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to allocate {size} bytes with alignment {align}")]
pub struct AllocError {
    pub size: usize,
    pub align: usize,
}

impl From<Layout> for AllocError {
    fn from(layout: Layout) -> Self {
        Self {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

/// Snapshot of an allocator's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub live_allocations: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub total_allocations: usize,
}

/// Memory source used by the coordinator for host buffers and per-execution
/// bookkeeping.
pub trait HostAllocator: fmt::Debug + Send + Sync {
    /// Allocate a block satisfying `layout`.
    ///
    /// # Errors
    /// When the underlying memory source cannot satisfy the request.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Return a block to the allocator.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this allocator with the
    /// same `layout` and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Current statistics.
    fn report(&self) -> AllocatorStats;
}

/// Build the allocator selected by `kind`.
#[must_use]
pub fn create_allocator(kind: AllocatorKind) -> Arc<dyn HostAllocator> {
    match kind {
        AllocatorKind::Malloc => Arc::new(SystemAllocator::default()),
        AllocatorKind::TestFixedSize => Arc::new(FixedSizeAllocator::default()),
        AllocatorKind::Profiled => {
            Arc::new(ProfiledAllocator::new(Box::new(SystemAllocator::default())))
        }
        AllocatorKind::LeakCheck => {
            Arc::new(LeakCheckAllocator::new(Box::new(SystemAllocator::default())))
        }
    }
}

fn non_zero(layout: Layout) -> Layout {
    if layout.size() == 0 {
        Layout::from_size_align(1, layout.align()).expect("non_zero: [1]")
    } else {
        layout
    }
}

#[derive(Debug, Default)]
struct Counters {
    live_allocations: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
}

impl Counters {
    fn on_allocate(&self, size: usize) {
        self.live_allocations.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
    }

    fn on_deallocate(&self, size: usize) {
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            live_allocations: self.live_allocations.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
        }
    }
}

/// Allocator backed by the global Rust allocator.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    counters: Counters,
}

impl HostAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let layout = non_zero(layout);
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(AllocError::from(layout))?;
        self.counters.on_allocate(layout.size());
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let layout = non_zero(layout);
        self.counters.on_deallocate(layout.size());
        // SAFETY: forwarded from the caller's contract; `non_zero` maps the
        // layout exactly as `allocate` did.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    fn report(&self) -> AllocatorStats {
        self.counters.snapshot()
    }
}

/// Test allocator that hands out whole fixed-size blocks.
///
/// Each request is rounded up to a multiple of `block_size` and aligned to at
/// least 16 bytes, so code that deallocates with a different layout than it
/// allocated with is caught by the global allocator.
#[derive(Debug)]
pub struct FixedSizeAllocator {
    block_size: usize,
    counters: Counters,
}

impl FixedSizeAllocator {
    pub const DEFAULT_BLOCK_SIZE: usize = 256;

    /// # Panics
    /// If `block_size` is zero.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        assert_ne!(block_size, 0, "FixedSizeAllocator: zero block size");
        Self {
            block_size,
            counters: Counters::default(),
        }
    }

    fn block_layout(&self, layout: Layout) -> Result<Layout, AllocError> {
        let blocks = layout.size().div_ceil(self.block_size).max(1);
        let size = blocks
            .checked_mul(self.block_size)
            .ok_or(AllocError::from(layout))?;
        Layout::from_size_align(size, layout.align().max(16)).map_err(|_| AllocError::from(layout))
    }
}

impl Default for FixedSizeAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BLOCK_SIZE)
    }
}

impl HostAllocator for FixedSizeAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let block = self.block_layout(layout)?;
        // SAFETY: `block` has a non-zero size.
        let ptr = NonNull::new(unsafe { std::alloc::alloc(block) }).ok_or(AllocError::from(layout))?;
        self.counters.on_allocate(block.size());
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let block = self
            .block_layout(layout)
            .expect("FixedSizeAllocator::deallocate: [1]");
        self.counters.on_deallocate(block.size());
        // SAFETY: `block` is computed from `layout` the same way `allocate`
        // computed it for this pointer.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), block) };
    }

    fn report(&self) -> AllocatorStats {
        self.counters.snapshot()
    }
}

/// Decorator recording allocation statistics, logged when it is dropped.
#[derive(Debug)]
pub struct ProfiledAllocator {
    inner: Box<dyn HostAllocator>,
    counters: Counters,
}

impl ProfiledAllocator {
    #[must_use]
    pub fn new(inner: Box<dyn HostAllocator>) -> Self {
        Self {
            inner,
            counters: Counters::default(),
        }
    }
}

impl HostAllocator for ProfiledAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.inner.allocate(layout)?;
        self.counters.on_allocate(layout.size());
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.counters.on_deallocate(layout.size());
        // SAFETY: forwarded from the caller's contract.
        unsafe { self.inner.deallocate(ptr, layout) };
    }

    fn report(&self) -> AllocatorStats {
        self.counters.snapshot()
    }
}

impl Drop for ProfiledAllocator {
    fn drop(&mut self) {
        let stats = self.counters.snapshot();
        tracing::info!(
            total_allocations = stats.total_allocations,
            peak_bytes = stats.peak_bytes,
            live_allocations = stats.live_allocations,
            live_bytes = stats.live_bytes,
            "host allocator profile"
        );
    }
}

/// Decorator tracking every outstanding block.
///
/// Deallocating an unknown pointer panics, and dropping the allocator while
/// blocks are still outstanding panics as well.
#[derive(Debug)]
pub struct LeakCheckAllocator {
    inner: Box<dyn HostAllocator>,
    outstanding: Mutex<HashMap<usize, Layout>>,
    counters: Counters,
}

impl LeakCheckAllocator {
    #[must_use]
    pub fn new(inner: Box<dyn HostAllocator>) -> Self {
        Self {
            inner,
            outstanding: Mutex::new(HashMap::default()),
            counters: Counters::default(),
        }
    }
}

impl HostAllocator for LeakCheckAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.inner.allocate(layout)?;
        let previous = self.outstanding.lock().insert(ptr.as_ptr() as usize, layout);
        assert!(previous.is_none(), "LeakCheckAllocator: address handed out twice");
        self.counters.on_allocate(layout.size());
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let recorded = self.outstanding.lock().remove(&(ptr.as_ptr() as usize));
        match recorded {
            Some(recorded) => assert_eq!(
                recorded, layout,
                "LeakCheckAllocator: deallocated with a different layout"
            ),
            None => panic!("LeakCheckAllocator: deallocating unknown pointer {ptr:p}"),
        }
        self.counters.on_deallocate(layout.size());
        // SAFETY: forwarded from the caller's contract.
        unsafe { self.inner.deallocate(ptr, layout) };
    }

    fn report(&self) -> AllocatorStats {
        self.counters.snapshot()
    }
}

impl Drop for LeakCheckAllocator {
    fn drop(&mut self) {
        let leaked = self.outstanding.get_mut();
        if leaked.is_empty() || std::thread::panicking() {
            return;
        }
        let bytes: usize = leaked.values().map(Layout::size).sum();
        tracing::error!(blocks = leaked.len(), bytes, "host memory leaked");
        panic!("LeakCheckAllocator: {} blocks ({bytes} bytes) leaked", leaked.len());
    }
}

/// Zero-initialized bytes owned through a `HostAllocator`.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    allocator: Arc<dyn HostAllocator>,
}

// SAFETY: the buffer exclusively owns its bytes; the allocator is `Send + Sync`.
unsafe impl Send for HostBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    /// # Errors
    /// When the layout is invalid or the allocator fails.
    pub fn new(
        allocator: &Arc<dyn HostAllocator>,
        size: usize,
        align: usize,
    ) -> Result<Self, AllocError> {
        let layout = Layout::from_size_align(size, align).map_err(|_| AllocError { size, align })?;
        let ptr = allocator.allocate(layout)?;
        // SAFETY: the block holds at least `size` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(Self {
            ptr,
            layout,
            allocator: Arc::clone(allocator),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for HostBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialized bytes for our lifetime.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }
}

impl DerefMut for HostBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated by `self.allocator` with `self.layout`.
        unsafe { self.allocator.deallocate(self.ptr, self.layout) };
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.len())
            .field("align", &self.align())
            .finish()
    }
}

/// Fixed-length array of `T` owned through a `HostAllocator`.
pub(crate) struct HostArray<T> {
    ptr: NonNull<T>,
    len: usize,
    allocator: Arc<dyn HostAllocator>,
}

// SAFETY: the array owns its elements like a `Box<[T]>` does.
unsafe impl<T: Send> Send for HostArray<T> {}
// SAFETY: as above.
unsafe impl<T: Sync> Sync for HostArray<T> {}

impl<T> HostArray<T> {
    pub(crate) fn from_fn(
        allocator: &Arc<dyn HostAllocator>,
        len: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Result<Self, AllocError> {
        let layout = Layout::array::<T>(len).map_err(|_| AllocError {
            size: len.saturating_mul(size_of::<T>()),
            align: align_of::<T>(),
        })?;
        let ptr = allocator.allocate(layout)?.cast::<T>();
        for idx in 0..len {
            // SAFETY: `idx < len` and the block is sized for `len` elements.
            unsafe { ptr.as_ptr().add(idx).write(init(idx)) };
        }
        Ok(Self {
            ptr,
            len,
            allocator: Arc::clone(allocator),
        })
    }

    fn layout(&self) -> Layout {
        Layout::array::<T>(self.len).expect("HostArray::layout: [1]")
    }
}

impl<T> Deref for HostArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: all `len` elements were initialized in `from_fn`.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for HostArray<T> {
    fn drop(&mut self) {
        // SAFETY: the elements are initialized and dropped exactly once here,
        // then the block is returned with the layout it was allocated with.
        unsafe {
            core::ptr::drop_in_place(core::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            ));
            self.allocator.deallocate(self.ptr.cast(), self.layout());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocators() -> Vec<Arc<dyn HostAllocator>> {
        [
            AllocatorKind::Malloc,
            AllocatorKind::TestFixedSize,
            AllocatorKind::Profiled,
            AllocatorKind::LeakCheck,
        ]
        .into_iter()
        .map(create_allocator)
        .collect()
    }

    #[test]
    fn buffers_are_zeroed_and_released() {
        for allocator in allocators() {
            let mut buffer = HostBuffer::new(&allocator, 100, 8).unwrap();
            assert_eq!(buffer.len(), 100);
            assert!(buffer.iter().all(|&b| b == 0));
            buffer[99] = 7;
            assert_eq!(allocator.report().live_allocations, 1);
            drop(buffer);
            let stats = allocator.report();
            assert_eq!(stats.live_allocations, 0);
            assert_eq!(stats.live_bytes, 0);
            assert_eq!(stats.total_allocations, 1);
        }
    }

    #[test]
    fn fixed_size_rounds_up_to_blocks() {
        let allocator: Arc<dyn HostAllocator> = Arc::new(FixedSizeAllocator::new(64));
        let buffer = HostBuffer::new(&allocator, 65, 4).unwrap();
        assert_eq!(allocator.report().live_bytes, 128);
        drop(buffer);
        let empty = HostBuffer::new(&allocator, 0, 1).unwrap();
        assert_eq!(allocator.report().live_bytes, 64);
        drop(empty);
    }

    #[test]
    fn profiled_tracks_peak() {
        let allocator: Arc<dyn HostAllocator> =
            Arc::new(ProfiledAllocator::new(Box::new(SystemAllocator::default())));
        let a = HostBuffer::new(&allocator, 40, 8).unwrap();
        let b = HostBuffer::new(&allocator, 60, 8).unwrap();
        drop(a);
        drop(b);
        let stats = allocator.report();
        assert_eq!(stats.peak_bytes, 100);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    #[should_panic(expected = "leaked")]
    fn leak_check_panics_on_outstanding_blocks() {
        let allocator = LeakCheckAllocator::new(Box::new(SystemAllocator::default()));
        let _leaked = allocator.allocate(Layout::new::<u64>()).unwrap();
        drop(allocator);
    }

    #[test]
    fn host_array_drops_elements() {
        let allocator = create_allocator(AllocatorKind::LeakCheck);
        let marker = Arc::new(());
        let array = HostArray::from_fn(&allocator, 5, |_| Arc::clone(&marker)).unwrap();
        assert_eq!(array.len(), 5);
        assert_eq!(Arc::strong_count(&marker), 6);
        drop(array);
        assert_eq!(Arc::strong_count(&marker), 1);
        assert_eq!(allocator.report().live_allocations, 0);
    }
}
