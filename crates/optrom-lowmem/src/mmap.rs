use std::collections::BTreeMap;
use std::io;

use crate::{AllocationError, AllocationHandle, LowAddr, LowMemory};

// Linux/x86_64 can be asked for the low 2 GiB directly. Elsewhere we pass a hint and verify
// where the kernel actually put the mapping.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const LOW_MAP_FLAGS: libc::c_int = libc::MAP_32BIT;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const LOW_MAP_FLAGS: libc::c_int = 0;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const ADDRESS_HINT: usize = 0;
#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
const ADDRESS_HINT: usize = 0x1000_0000;

#[derive(Debug, Copy, Clone)]
struct Mapping {
    size: u32,
    len: usize,
}

/// Anonymous private mappings placed below 4 GiB.
///
/// Every live mapping is tracked, so freeing a handle from another allocator is an error rather
/// than a stray `munmap`. Mappings still live when the allocator is dropped are unmapped then.
pub struct MmapAllocator {
    page_size: usize,
    mappings: BTreeMap<u32, Mapping>,
}

impl MmapAllocator {
    pub fn new() -> Self {
        // SAFETY: `sysconf` has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 {
            page_size as usize
        } else {
            0x1000
        };
        Self {
            page_size,
            mappings: BTreeMap::new(),
        }
    }

    fn lookup(&self, handle: &AllocationHandle) -> Option<Mapping> {
        self.mappings
            .get(&handle.address().get())
            .copied()
            .filter(|mapping| mapping.size == handle.size())
    }
}

impl Default for MmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LowMemory for MmapAllocator {
    fn allocate(&mut self, size: u32) -> Result<AllocationHandle, AllocationError> {
        if size == 0 {
            return Err(AllocationError::InvalidSize);
        }

        let len = (size as usize).next_multiple_of(self.page_size);
        // SAFETY: an anonymous private mapping with a non-zero length; the hint is not fixed.
        let ptr = unsafe {
            libc::mmap(
                ADDRESS_HINT as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | LOW_MAP_FLAGS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            tracing::debug!(size, errno, "mmap failed");
            return Err(AllocationError::HostRefused { size, errno });
        }

        let address = match LowAddr::from_ptr(ptr) {
            Ok(address) if address.fits(size) => address,
            _ => {
                // SAFETY: `ptr` is the mapping of `len` bytes created above.
                unsafe {
                    libc::munmap(ptr, len);
                }
                return Err(AllocationError::OutOfRange {
                    address: ptr as usize as u64,
                    size,
                });
            }
        };

        tracing::debug!(%address, size, "mapped low region");
        self.mappings.insert(address.get(), Mapping { size, len });
        Ok(AllocationHandle::new(address, size))
    }

    fn free(&mut self, handle: AllocationHandle) -> Result<(), AllocationError> {
        let Some(mapping) = self.lookup(&handle) else {
            return Err(AllocationError::UnknownHandle {
                address: handle.address().get(),
                size: handle.size(),
            });
        };
        self.mappings.remove(&handle.address().get());
        // SAFETY: tracked mappings are live and `mapping.len` bytes long.
        unsafe {
            libc::munmap(handle.address().as_mut_ptr().cast(), mapping.len);
        }
        tracing::debug!(address = %handle.address(), size = handle.size(), "unmapped low region");
        Ok(())
    }

    fn bytes(&self, handle: &AllocationHandle) -> Option<&[u8]> {
        let mapping = self.lookup(handle)?;
        // SAFETY: the mapping is live (tracked) and at least `mapping.size` bytes long.
        Some(unsafe {
            std::slice::from_raw_parts(handle.address().as_mut_ptr(), mapping.size as usize)
        })
    }

    fn bytes_mut(&mut self, handle: &AllocationHandle) -> Option<&mut [u8]> {
        let mapping = self.lookup(handle)?;
        // SAFETY: as above; `&mut self` keeps the mapping from being freed while borrowed.
        Some(unsafe {
            std::slice::from_raw_parts_mut(handle.address().as_mut_ptr(), mapping.size as usize)
        })
    }

    fn live_allocations(&self) -> usize {
        self.mappings.len()
    }
}

impl Drop for MmapAllocator {
    fn drop(&mut self) {
        if !self.mappings.is_empty() {
            tracing::warn!(count = self.mappings.len(), "unmapping regions that were never freed");
        }
        for (&address, mapping) in &self.mappings {
            // SAFETY: every tracked mapping is still live.
            unsafe {
                libc::munmap(LowAddr::new(address).as_mut_ptr().cast(), mapping.len);
            }
        }
    }
}
