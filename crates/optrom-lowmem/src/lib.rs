//! Host memory that is addressable through 32-bit PCI registers.
//!
//! BARs and the expansion ROM base register are 32 bits wide, so every region a device decodes
//! has to sit below the 4 GiB line even when the host process is 64-bit. [`LowMemory`] is the
//! allocation seam used by the config-space builder and the ROM loader:
//!
//! - [`MmapAllocator`] maps anonymous pages and insists the kernel placed them below 4 GiB.
//! - [`HeapAllocator`] is the fallback for targets where every heap address already fits.
//! - [`WindowAllocator`] hands out addresses from a fixed 32-bit window backed by host buffers,
//!   which keeps addresses deterministic across runs.

mod addr;
mod heap;
#[cfg(unix)]
mod mmap;
mod window;

pub use addr::{AddressOutOfRange, LowAddr, LOW_LIMIT};
pub use heap::HeapAllocator;
#[cfg(unix)]
pub use mmap::MmapAllocator;
pub use window::{WindowAllocator, WindowAllocatorConfig};

/// The native allocator for the current host.
#[cfg(all(unix, target_pointer_width = "64"))]
pub type DefaultAllocator = MmapAllocator;

/// The native allocator for the current host.
#[cfg(not(all(unix, target_pointer_width = "64")))]
pub type DefaultAllocator = HeapAllocator;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocationError {
    #[error("allocation size must be non-zero")]
    InvalidSize,

    #[error("region {address:#x}+{size:#x} is not addressable in 32 bits")]
    OutOfRange { address: u64, size: u32 },

    #[error("host refused to map {size:#x} bytes (os error {errno})")]
    HostRefused { size: u32, errno: i32 },

    #[error("no room left for {size:#x} bytes")]
    Exhausted { size: u32 },

    #[error("handle {address:#x}+{size:#x} was not issued by this allocator")]
    UnknownHandle { address: u32, size: u32 },
}

/// A live region returned by [`LowMemory::allocate`].
///
/// Handles are neither `Clone` nor `Copy`: each one is released exactly once, by passing it back
/// to [`LowMemory::free`] on the allocator that issued it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped handle leaks its region until the allocator itself is dropped"]
pub struct AllocationHandle {
    address: LowAddr,
    size: u32,
}

impl AllocationHandle {
    pub(crate) fn new(address: LowAddr, size: u32) -> Self {
        debug_assert!(address.fits(size));
        Self { address, size }
    }

    pub fn address(&self) -> LowAddr {
        self.address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn end_exclusive(&self) -> u64 {
        u64::from(self.address.get()) + u64::from(self.size)
    }
}

/// Allocation of regions whose addresses fit a 32-bit register.
pub trait LowMemory {
    /// Reserves `size` zero-filled bytes with `address + size <= 0xFFFF_FFFF`, or fails.
    fn allocate(&mut self, size: u32) -> Result<AllocationHandle, AllocationError>;

    /// Releases a region. Handles this allocator did not issue are rejected.
    fn free(&mut self, handle: AllocationHandle) -> Result<(), AllocationError>;

    fn bytes(&self, handle: &AllocationHandle) -> Option<&[u8]>;

    fn bytes_mut(&mut self, handle: &AllocationHandle) -> Option<&mut [u8]>;

    /// Number of regions allocated and not yet freed.
    fn live_allocations(&self) -> usize;
}

impl<M: LowMemory + ?Sized> LowMemory for &mut M {
    fn allocate(&mut self, size: u32) -> Result<AllocationHandle, AllocationError> {
        (**self).allocate(size)
    }

    fn free(&mut self, handle: AllocationHandle) -> Result<(), AllocationError> {
        (**self).free(handle)
    }

    fn bytes(&self, handle: &AllocationHandle) -> Option<&[u8]> {
        (**self).bytes(handle)
    }

    fn bytes_mut(&mut self, handle: &AllocationHandle) -> Option<&mut [u8]> {
        (**self).bytes_mut(handle)
    }

    fn live_allocations(&self) -> usize {
        (**self).live_allocations()
    }
}

impl<M: LowMemory + ?Sized> LowMemory for Box<M> {
    fn allocate(&mut self, size: u32) -> Result<AllocationHandle, AllocationError> {
        (**self).allocate(size)
    }

    fn free(&mut self, handle: AllocationHandle) -> Result<(), AllocationError> {
        (**self).free(handle)
    }

    fn bytes(&self, handle: &AllocationHandle) -> Option<&[u8]> {
        (**self).bytes(handle)
    }

    fn bytes_mut(&mut self, handle: &AllocationHandle) -> Option<&mut [u8]> {
        (**self).bytes_mut(handle)
    }

    fn live_allocations(&self) -> usize {
        (**self).live_allocations()
    }
}
