use std::alloc::{self, Layout};
use std::collections::BTreeMap;

use crate::{AllocationError, AllocationHandle, LowAddr, LowMemory};

const HEAP_ALIGN: usize = 16;

/// Ordinary zeroed heap allocations, checked against the 32-bit bound.
///
/// On 32-bit hosts every address fits and this is the native allocator. On 64-bit hosts it still
/// honours the contract, which in practice means most requests fail with
/// [`AllocationError::OutOfRange`].
#[derive(Default)]
pub struct HeapAllocator {
    blocks: BTreeMap<u32, Layout>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, handle: &AllocationHandle) -> Option<Layout> {
        self.blocks
            .get(&handle.address().get())
            .copied()
            .filter(|layout| layout.size() == handle.size() as usize)
    }
}

impl LowMemory for HeapAllocator {
    fn allocate(&mut self, size: u32) -> Result<AllocationHandle, AllocationError> {
        if size == 0 {
            return Err(AllocationError::InvalidSize);
        }
        let layout = Layout::from_size_align(size as usize, HEAP_ALIGN)
            .map_err(|_| AllocationError::Exhausted { size })?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllocationError::Exhausted { size });
        }

        match LowAddr::from_ptr(ptr) {
            Ok(address) if address.fits(size) => {
                self.blocks.insert(address.get(), layout);
                Ok(AllocationHandle::new(address, size))
            }
            _ => {
                // SAFETY: `ptr` was just allocated with `layout`.
                unsafe { alloc::dealloc(ptr, layout) };
                Err(AllocationError::OutOfRange {
                    address: ptr as usize as u64,
                    size,
                })
            }
        }
    }

    fn free(&mut self, handle: AllocationHandle) -> Result<(), AllocationError> {
        let Some(layout) = self.lookup(&handle) else {
            return Err(AllocationError::UnknownHandle {
                address: handle.address().get(),
                size: handle.size(),
            });
        };
        self.blocks.remove(&handle.address().get());
        // SAFETY: tracked blocks are live and were allocated with `layout`.
        unsafe { alloc::dealloc(handle.address().as_mut_ptr(), layout) };
        Ok(())
    }

    fn bytes(&self, handle: &AllocationHandle) -> Option<&[u8]> {
        let layout = self.lookup(handle)?;
        let ptr = handle.address().as_mut_ptr();
        // SAFETY: the block is live (tracked) and `layout.size()` bytes long; `&self` keeps it
        // from being freed while borrowed.
        Some(unsafe { std::slice::from_raw_parts(ptr, layout.size()) })
    }

    fn bytes_mut(&mut self, handle: &AllocationHandle) -> Option<&mut [u8]> {
        let layout = self.lookup(handle)?;
        let ptr = handle.address().as_mut_ptr();
        // SAFETY: as above; `&mut self` makes this the only borrow of the block.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, layout.size()) })
    }

    fn live_allocations(&self) -> usize {
        self.blocks.len()
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        for (&address, &layout) in &self.blocks {
            // SAFETY: every tracked block is still live and was allocated with `layout`.
            unsafe { alloc::dealloc(LowAddr::new(address).as_mut_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HeapAllocator;
    use crate::{AllocationError, LowMemory, LOW_LIMIT};

    #[test]
    fn allocation_is_in_range_or_fails_cleanly() {
        let mut heap = HeapAllocator::new();
        match heap.allocate(0x100) {
            Ok(handle) => {
                assert!(handle.end_exclusive() <= LOW_LIMIT);
                assert!(heap.bytes(&handle).unwrap().iter().all(|&b| b == 0));
                heap.free(handle).unwrap();
            }
            Err(AllocationError::OutOfRange { address, size }) => {
                assert!(address + u64::from(size) > LOW_LIMIT)
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
        assert_eq!(heap.live_allocations(), 0);
    }
}
