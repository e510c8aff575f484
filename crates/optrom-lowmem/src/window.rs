use std::collections::BTreeMap;

use crate::{AllocationError, AllocationHandle, LowAddr, LowMemory, LOW_LIMIT};

#[derive(Debug, Clone)]
pub struct WindowAllocatorConfig {
    /// First bus address handed out.
    pub base: u32,
    pub size: u32,
    /// Minimum alignment of every region; must be a power of two.
    ///
    /// Regions are also aligned to their own size rounded up to a power of two, the way BARs
    /// are naturally aligned on a real bus.
    pub align: u32,
}

impl Default for WindowAllocatorConfig {
    fn default() -> Self {
        // Same neighbourhood a PC BIOS assigns 32-bit MMIO BARs from.
        Self {
            base: 0xE000_0000,
            size: 0x1000_0000,
            align: 0x1000,
        }
    }
}

/// Bus addresses from a fixed 32-bit window, each region backed by a host buffer.
///
/// Placement is first-fit over the gaps between live regions, so freeing everything and
/// allocating the same sequence again yields the same addresses.
#[derive(Debug)]
pub struct WindowAllocator {
    cfg: WindowAllocatorConfig,
    regions: BTreeMap<u32, Box<[u8]>>,
}

impl WindowAllocator {
    pub fn new(cfg: WindowAllocatorConfig) -> Self {
        assert!(cfg.align.is_power_of_two(), "window alignment must be a power of two");
        Self {
            cfg,
            regions: BTreeMap::new(),
        }
    }

    fn window_end(&self) -> u64 {
        (u64::from(self.cfg.base) + u64::from(self.cfg.size)).min(LOW_LIMIT)
    }

    fn find_gap(&self, size: u32) -> Option<u64> {
        let size = u64::from(size);
        let align = size.next_power_of_two().max(u64::from(self.cfg.align));
        let mut base = align_up_u64(u64::from(self.cfg.base), align);

        for (&start, buf) in &self.regions {
            let start = u64::from(start);
            let end = start + buf.len() as u64;
            if base + size <= start {
                break;
            }
            if end > base {
                base = align_up_u64(end, align);
            }
        }

        (base + size <= self.window_end()).then_some(base)
    }

    fn lookup(&self, handle: &AllocationHandle) -> Option<&[u8]> {
        self.regions
            .get(&handle.address().get())
            .map(|buf| &buf[..])
            .filter(|buf| buf.len() == handle.size() as usize)
    }
}

impl Default for WindowAllocator {
    fn default() -> Self {
        Self::new(WindowAllocatorConfig::default())
    }
}

impl LowMemory for WindowAllocator {
    fn allocate(&mut self, size: u32) -> Result<AllocationHandle, AllocationError> {
        if size == 0 {
            return Err(AllocationError::InvalidSize);
        }
        let Some(base) = self.find_gap(size) else {
            return Err(AllocationError::Exhausted { size });
        };
        let address = LowAddr::try_from(base)
            .ok()
            .filter(|addr| addr.fits(size))
            .ok_or(AllocationError::OutOfRange {
                address: base,
                size,
            })?;

        self.regions
            .insert(address.get(), vec![0u8; size as usize].into_boxed_slice());
        tracing::debug!(%address, size, "window region allocated");
        Ok(AllocationHandle::new(address, size))
    }

    fn free(&mut self, handle: AllocationHandle) -> Result<(), AllocationError> {
        if self.lookup(&handle).is_none() {
            return Err(AllocationError::UnknownHandle {
                address: handle.address().get(),
                size: handle.size(),
            });
        }
        self.regions.remove(&handle.address().get());
        tracing::debug!(
            address = %handle.address(),
            size = handle.size(),
            "window region freed"
        );
        Ok(())
    }

    fn bytes(&self, handle: &AllocationHandle) -> Option<&[u8]> {
        self.lookup(handle)
    }

    fn bytes_mut(&mut self, handle: &AllocationHandle) -> Option<&mut [u8]> {
        self.regions
            .get_mut(&handle.address().get())
            .filter(|buf| buf.len() == handle.size() as usize)
            .map(|buf| &mut buf[..])
    }

    fn live_allocations(&self) -> usize {
        self.regions.len()
    }
}

fn align_up_u64(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}
