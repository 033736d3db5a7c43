//! # Allocator Boundary
//!
//! Every host-side object a device creates is charged to that device's
//! allocator. The allocator is an explicit object stored per device, never a
//! process-wide hook, so tests can swap in counting or failing allocators.
//!
//! ## Contract
//!
//! - `alloc(size, alignment)` returns an allocation or `None` (out of memory)
//! - `free(allocation)` releases exactly what `alloc` returned
//! - Building an allocator from callbacks with a missing half is an error

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{HalError, HalResult};

/// A block handed out by a [`HostAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostAllocation {
    address: u64,
    size: usize,
    alignment: usize,
}

impl HostAllocation {
    /// Describes an allocation at `address`.
    #[must_use]
    pub const fn new(address: u64, size: usize, alignment: usize) -> Self {
        Self {
            address,
            size,
            alignment,
        }
    }

    /// Opaque address chosen by the allocator.
    #[must_use]
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment in bytes.
    #[must_use]
    pub const fn alignment(&self) -> usize {
        self.alignment
    }
}

/// Host allocator used for object bookkeeping.
pub trait HostAllocator: Send + Sync + fmt::Debug {
    /// Allocates `size` bytes aligned to `alignment`.
    fn alloc(&self, size: usize, alignment: usize) -> Option<HostAllocation>;

    /// Releases an allocation previously returned by [`HostAllocator::alloc`].
    fn free(&self, allocation: HostAllocation);
}

/// Charges the footprint of a `T` to `allocator`.
pub fn charge<T>(allocator: &dyn HostAllocator) -> HalResult<HostAllocation> {
    let size = std::mem::size_of::<T>().max(1);
    allocator
        .alloc(size, std::mem::align_of::<T>())
        .ok_or(HalError::OutOfMemory {
            requested: size as u64,
            available: 0,
        })
}

/// An allocation that returns itself to its allocator when dropped.
///
/// Every HAL object holds one, so destroying the object (or dropping it)
/// always releases its bookkeeping to the device that created it.
pub struct HostCharge {
    allocator: Arc<dyn HostAllocator>,
    allocation: Option<HostAllocation>,
}

impl HostCharge {
    /// Charges the footprint of a `T` to `allocator`.
    pub fn for_object<T>(allocator: &Arc<dyn HostAllocator>) -> HalResult<Self> {
        let allocation = charge::<T>(allocator.as_ref())?;
        Ok(Self {
            allocator: Arc::clone(allocator),
            allocation: Some(allocation),
        })
    }

    /// The underlying allocation.
    #[must_use]
    pub fn allocation(&self) -> Option<HostAllocation> {
        self.allocation
    }
}

impl fmt::Debug for HostCharge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCharge")
            .field("allocation", &self.allocation)
            .finish()
    }
}

impl Drop for HostCharge {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.allocator.free(allocation);
        }
    }
}

/// Default allocator. Memory itself is owned by Rust; this only keeps counts.
#[derive(Debug, Default)]
pub struct SystemAllocator {
    next_address: AtomicU64,
    live_bytes: AtomicU64,
    live_allocations: AtomicU64,
}

impl SystemAllocator {
    /// Creates a new allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Allocations currently outstanding.
    #[must_use]
    pub fn live_allocations(&self) -> u64 {
        self.live_allocations.load(Ordering::Relaxed)
    }
}

impl HostAllocator for SystemAllocator {
    fn alloc(&self, size: usize, alignment: usize) -> Option<HostAllocation> {
        let alignment = alignment.max(1) as u64;
        let span = (size as u64).div_ceil(alignment) * alignment;
        let base = self.next_address.fetch_add(span.max(alignment), Ordering::Relaxed);
        self.live_bytes.fetch_add(size as u64, Ordering::Relaxed);
        self.live_allocations.fetch_add(1, Ordering::Relaxed);
        Some(HostAllocation::new(base, size, alignment as usize))
    }

    fn free(&self, allocation: HostAllocation) {
        self.live_bytes
            .fetch_sub(allocation.size() as u64, Ordering::Relaxed);
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Allocation callback: `(size, alignment) -> address`.
pub type AllocFn = Arc<dyn Fn(usize, usize) -> Option<u64> + Send + Sync>;

/// Free callback: `(address)`.
pub type FreeFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Allocator assembled from a pair of caller callbacks.
pub struct CallbackAllocator {
    alloc: AllocFn,
    free: FreeFn,
}

impl CallbackAllocator {
    /// Builds an allocator from an `alloc`/`free` pair.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::NullAllocatorCallback`] if either half is missing.
    pub fn new(alloc: Option<AllocFn>, free: Option<FreeFn>) -> HalResult<Self> {
        let alloc = alloc.ok_or(HalError::NullAllocatorCallback("alloc"))?;
        let free = free.ok_or(HalError::NullAllocatorCallback("free"))?;
        Ok(Self { alloc, free })
    }
}

impl fmt::Debug for CallbackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackAllocator").finish_non_exhaustive()
    }
}

impl HostAllocator for CallbackAllocator {
    fn alloc(&self, size: usize, alignment: usize) -> Option<HostAllocation> {
        (self.alloc)(size, alignment).map(|address| HostAllocation::new(address, size, alignment))
    }

    fn free(&self, allocation: HostAllocation) {
        (self.free)(allocation.address());
    }
}
