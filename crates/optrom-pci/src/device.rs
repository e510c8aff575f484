use optrom_lowmem::{AllocationError, AllocationHandle, LowAddr, LowMemory};

use crate::access::{AccessDirection, AccessError, AccessWidth, PciAccessFunc, PciConfigAccess};
use crate::config::{
    bar_at, bar_offset, PciClassCode, PciVendorDeviceId, PCI_BAR_COUNT,
    PCI_BAR_MEM_ADDR_MASK, PCI_CLASS_CODE_OFFSET, PCI_COMMAND_OFFSET, PCI_CONFIG_SPACE_SIZE,
    PCI_DEVICE_ID_OFFSET, PCI_EXPANSION_ROM_OFFSET, PCI_HEADER_TYPE_OFFSET, PCI_STATUS_OFFSET,
    PCI_VENDOR_ID_OFFSET,
};
use crate::descriptor::DeviceDescriptor;
use crate::info::{PciBdf, PciDeviceInfo};

/// Where the option ROM image was loaded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RomRegion {
    pub address: LowAddr,
    pub size: u32,
}

impl RomRegion {
    /// Validates a host address before it is trusted to fit the expansion ROM register.
    pub fn try_new(address: u64, size: u32) -> Result<Self, BuildError> {
        let out_of_range = BuildError::RomOutOfRange { address, size };
        let address = LowAddr::try_from(address).map_err(|_| out_of_range)?;
        if !address.fits(size) {
            return Err(out_of_range);
        }
        Ok(Self { address, size })
    }
}

impl From<&AllocationHandle> for RomRegion {
    fn from(handle: &AllocationHandle) -> Self {
        Self {
            address: handle.address(),
            size: handle.size(),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("expansion ROM at {address:#x}+{size:#x} is not addressable in 32 bits")]
    RomOutOfRange { address: u64, size: u32 },

    #[error("could not back BAR{bar} with {size:#x} bytes")]
    AllocationFailed {
        bar: u8,
        size: u32,
        #[source]
        source: AllocationError,
    },
}

/// Cached state behind one BAR register.
///
/// `probe` is set by the all-ones sizing write and cleared by the next dword read of the BAR
/// (or by any write to it). A slot with size 0 never arms; its register stores whatever is
/// written, all-ones included.
#[derive(Debug, Default)]
pub struct BarSlot {
    size: u32,
    backing: Option<AllocationHandle>,
    probe: bool,
}

impl BarSlot {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn backing_address(&self) -> u32 {
        self.backing
            .as_ref()
            .map_or(0, |handle| handle.address().get())
    }

    pub fn probe_pending(&self) -> bool {
        self.probe
    }

    pub fn is_implemented(&self) -> bool {
        self.size != 0
    }

    /// Register value while the BAR is being sized: `!(window - 1)` with the memory-space type
    /// bits clear, where the window is the size rounded up to a power of two (at least 16).
    pub fn size_mask(&self) -> u32 {
        if self.size == 0 {
            return 0;
        }
        let window = u64::from(self.size).next_power_of_two().max(0x10);
        !(window - 1) as u32 & PCI_BAR_MEM_ADDR_MASK
    }

    fn register_value(&self) -> u32 {
        self.backing_address() & PCI_BAR_MEM_ADDR_MASK
    }
}

/// One emulated PCI function: the 256-byte type-0 header plus its BAR slots.
///
/// A `Device` is exclusively owned by whoever drives the emulation; there is no shared state
/// between devices.
#[derive(Debug)]
pub struct Device {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    bars: [BarSlot; PCI_BAR_COUNT],
    rom: Option<RomRegion>,
    bdf: PciBdf,
}

impl Default for Device {
    fn default() -> Self {
        Self::new(PciBdf::default())
    }
}

impl Device {
    pub fn new(bdf: PciBdf) -> Self {
        Self {
            bytes: [0u8; PCI_CONFIG_SPACE_SIZE],
            bars: Default::default(),
            rom: None,
            bdf,
        }
    }

    /// Builds a fresh device in one step.
    pub fn from_descriptor<M: LowMemory + ?Sized>(
        bdf: PciBdf,
        descriptor: &DeviceDescriptor,
        rom: RomRegion,
        mem: &mut M,
    ) -> Result<Self, BuildError> {
        let mut device = Self::new(bdf);
        device.build(descriptor, rom, mem)?;
        Ok(device)
    }

    /// (Re)builds the configuration image from `descriptor`.
    ///
    /// All previous state is discarded first, including the memory behind previously built
    /// BARs. If a BAR cannot be backed, every BAR allocated by this call is released again and
    /// the device is left empty.
    pub fn build<M: LowMemory + ?Sized>(
        &mut self,
        descriptor: &DeviceDescriptor,
        rom: RomRegion,
        mem: &mut M,
    ) -> Result<(), BuildError> {
        if !rom.address.fits(rom.size) {
            return Err(BuildError::RomOutOfRange {
                address: u64::from(rom.address),
                size: rom.size,
            });
        }

        self.release(mem);
        self.bytes = [0u8; PCI_CONFIG_SPACE_SIZE];
        self.bars = Default::default();
        self.rom = None;

        let resolved = descriptor.resolve();
        self.write_u16(PCI_VENDOR_ID_OFFSET, resolved.vendor_id);
        self.write_u16(PCI_DEVICE_ID_OFFSET, resolved.device_id);
        self.write_u16(PCI_COMMAND_OFFSET, 0);
        self.write_u16(PCI_STATUS_OFFSET, 0);
        self.write_u32(PCI_CLASS_CODE_OFFSET, resolved.class_code.to_dword());

        for (index, &size) in resolved.bar_sizes.iter().enumerate() {
            if size == 0 {
                continue;
            }
            let handle = match mem.allocate(size) {
                Ok(handle) => handle,
                Err(source) => {
                    tracing::warn!(
                        bar = index,
                        size,
                        %source,
                        "BAR allocation failed, unwinding build"
                    );
                    self.release(mem);
                    self.bytes = [0u8; PCI_CONFIG_SPACE_SIZE];
                    return Err(BuildError::AllocationFailed {
                        bar: index as u8,
                        size,
                        source,
                    });
                }
            };

            self.bars[index] = BarSlot {
                size,
                backing: Some(handle),
                probe: false,
            };
            let value = self.bars[index].register_value();
            self.write_u32(bar_offset(index), value);
            tracing::debug!(
                bar = index,
                size,
                base = format_args!("{value:#010x}"),
                "BAR backed"
            );
        }

        self.write_u32(PCI_EXPANSION_ROM_OFFSET, rom.address.get());
        self.rom = Some(rom);

        tracing::debug!(
            bdf = %self.bdf,
            vendor_id = format_args!("{:#06x}", resolved.vendor_id),
            device_id = format_args!("{:#06x}", resolved.device_id),
            bars = self.allocated_bars(),
            "configuration space built"
        );
        Ok(())
    }

    /// Frees the memory behind every BAR and disables them. Returns how many regions were freed.
    pub fn release<M: LowMemory + ?Sized>(&mut self, mem: &mut M) -> usize {
        let mut freed = 0;
        for index in 0..PCI_BAR_COUNT {
            let Some(handle) = self.bars[index].backing.take() else {
                continue;
            };
            match mem.free(handle) {
                Ok(()) => freed += 1,
                Err(err) => tracing::warn!(bar = index, %err, "failed to release BAR memory"),
            }
            self.bars[index] = BarSlot::default();
            self.write_u32(bar_offset(index), 0);
        }
        freed
    }

    /// Serves one configuration access from the engine.
    ///
    /// Reads return the register value, writes return the value written (truncated to `width`).
    pub fn access(
        &mut self,
        offset: u16,
        width: AccessWidth,
        direction: AccessDirection,
        value: u32,
    ) -> Result<u32, AccessError> {
        let off = usize::from(offset);
        if off + width.len() > PCI_CONFIG_SPACE_SIZE {
            tracing::warn!(offset, %width, "configuration access outside the header");
            return Err(AccessError::OutOfRange { offset, width });
        }

        match direction {
            AccessDirection::Read => Ok(self.read(off, width)),
            AccessDirection::Write => {
                let value = value & width.mask();
                self.write(off, width, value);
                Ok(value)
            }
        }
    }

    fn read(&mut self, off: usize, width: AccessWidth) -> u32 {
        if width == AccessWidth::Dword {
            if let Some(index) = bar_at(off) {
                let bar = &mut self.bars[index];
                if bar.probe {
                    bar.probe = false;
                    let mask = bar.size_mask();
                    let base = bar.register_value();
                    self.write_u32(off, base);
                    tracing::trace!(
                        bar = index,
                        mask = format_args!("{mask:#010x}"),
                        "BAR size read"
                    );
                    return mask;
                }
            }
        }

        let mut value = 0u32;
        for i in 0..width.len() {
            value |= u32::from(self.bytes[off + i]) << (8 * i);
        }
        value
    }

    fn write(&mut self, off: usize, width: AccessWidth, value: u32) {
        let end = off + width.len();

        // Any write that touches an armed BAR cancels the sizing cycle first.
        for index in 0..PCI_BAR_COUNT {
            let start = bar_offset(index);
            if self.bars[index].probe && off < start + 4 && start < end {
                self.bars[index].probe = false;
                let base = self.bars[index].register_value();
                self.write_u32(start, base);
                tracing::trace!(bar = index, "BAR sizing cancelled by write");
            }
        }

        if width == AccessWidth::Dword && value == 0xFFFF_FFFF {
            if let Some(index) = bar_at(off).filter(|&i| self.bars[i].is_implemented()) {
                let mask = self.bars[index].size_mask();
                self.bars[index].probe = true;
                self.write_u32(off, mask);
                tracing::trace!(bar = index, "BAR sizing armed");
                return;
            }
        }

        // Everything else, unimplemented BARs included, is stored raw.
        for (i, addr) in (off..end).enumerate() {
            self.bytes[addr] = (value >> (8 * i)) as u8;
        }
    }

    pub fn config_bytes(&self) -> &[u8; PCI_CONFIG_SPACE_SIZE] {
        &self.bytes
    }

    pub fn bars(&self) -> &[BarSlot; PCI_BAR_COUNT] {
        &self.bars
    }

    pub fn bar(&self, index: usize) -> Option<&BarSlot> {
        self.bars.get(index)
    }

    pub fn allocated_bars(&self) -> usize {
        self.bars.iter().filter(|bar| bar.backing.is_some()).count()
    }

    pub fn rom(&self) -> Option<RomRegion> {
        self.rom
    }

    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: self.read_u16(PCI_VENDOR_ID_OFFSET),
            device_id: self.read_u16(PCI_DEVICE_ID_OFFSET),
        }
    }

    pub fn class_code(&self) -> PciClassCode {
        PciClassCode::from_dword(self.read_u32(PCI_CLASS_CODE_OFFSET))
    }

    /// Snapshot for the engine. BAR bases come from the slots, not the (possibly probed) image.
    pub fn info(&self) -> PciDeviceInfo {
        let ids = self.vendor_device_id();
        PciDeviceInfo {
            bdf: self.bdf,
            vendor_id: ids.vendor_id,
            device_id: ids.device_id,
            command: self.read_u16(PCI_COMMAND_OFFSET),
            status: self.read_u16(PCI_STATUS_OFFSET),
            class_code: self.class_code(),
            header_type: self.bytes[PCI_HEADER_TYPE_OFFSET],
            bar_base: core::array::from_fn(|i| self.bars[i].register_value()),
            bar_len: core::array::from_fn(|i| self.bars[i].size),
            rom_base: self.rom.map_or(0, |rom| rom.address.get()),
            rom_len: self.rom.map_or(0, |rom| rom.size),
        }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl PciConfigAccess for Device {
    fn access_reg(
        &mut self,
        index: u16,
        value: u32,
        func: PciAccessFunc,
    ) -> Result<u32, AccessError> {
        self.access(index, func.width(), func.direction(), value)
    }
}

#[cfg(test)]
mod tests {
    use optrom_lowmem::{LowAddr, LowMemory, WindowAllocator, WindowAllocatorConfig};

    use super::{BarSlot, BuildError, Device, RomRegion};
    use crate::access::{AccessDirection, AccessError, AccessWidth, PciConfigAccess};
    use crate::descriptor::DeviceDescriptor;
    use crate::info::PciBdf;

    const ROM: RomRegion = RomRegion {
        address: LowAddr::new(0x000C_0000),
        size: 0x8000,
    };

    fn window() -> WindowAllocator {
        WindowAllocator::new(WindowAllocatorConfig {
            base: 0xE000_0000,
            size: 0x10_0000,
            align: 0x1000,
        })
    }

    fn empty() -> DeviceDescriptor {
        DeviceDescriptor::default()
    }

    fn with_bar(mem: &mut WindowAllocator, index: usize, size: &str) -> Device {
        Device::from_descriptor(PciBdf::default(), &descriptor_with_bar(index, size), ROM, mem)
            .unwrap()
    }

    fn descriptor_with_bar(index: usize, size: &str) -> DeviceDescriptor {
        let mut desc = DeviceDescriptor {
            vendor_id: Some("1234".into()),
            device_id: Some("1111".into()),
            class: Some("03".into()),
            ..Default::default()
        };
        desc.set_bar_size(index, size);
        desc
    }

    #[test]
    fn header_fields_land_at_their_offsets() {
        let mut mem = window();
        let desc = DeviceDescriptor {
            vendor_id: Some("0x8086".into()),
            device_id: Some("0x1234".into()),
            class: Some("0x03".into()),
            subclass: Some("0x01".into()),
            prog_if: Some("0x02".into()),
            revision_id: Some("0x0a".into()),
            ..Default::default()
        };
        let mut dev = Device::from_descriptor(PciBdf::default(), &desc, ROM, &mut mem).unwrap();

        assert_eq!(&dev.config_bytes()[0..4], &[0x86, 0x80, 0x34, 0x12]);
        assert_eq!(dev.read_dword(0x00).unwrap(), 0x1234_8086);
        assert_eq!(dev.read_dword(0x04).unwrap(), 0);
        assert_eq!(dev.read_dword(0x08).unwrap(), 0x0301_020A);
        assert_eq!(dev.read_byte(0x0B).unwrap(), 0x03);
        assert_eq!(dev.read_byte(0x0E).unwrap(), 0);
        assert_eq!(dev.read_dword(0x30).unwrap(), 0x000C_0000);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn size_mask_rounds_up_to_a_power_of_two() {
        let bar = |size| BarSlot {
            size,
            backing: None,
            probe: false,
        };
        assert_eq!(bar(0x2000).size_mask(), 0xFFFF_E000);
        assert_eq!(bar(0x1800).size_mask(), 0xFFFF_E000);
        assert_eq!(bar(4).size_mask(), 0xFFFF_FFF0);
        assert_eq!(bar(0x8000_0001).size_mask(), 0);
        assert_eq!(bar(0).size_mask(), 0);
    }

    #[test]
    fn bar_size_is_read_once_then_the_base_returns() {
        let mut mem = window();
        let mut dev = with_bar(&mut mem, 2, "0x2000");
        let base = dev.bar(2).unwrap().backing_address();
        assert_eq!(base, 0xE000_0000);
        assert_eq!(dev.read_dword(0x18).unwrap(), base & 0xFFFF_FFF0);

        dev.write_dword(0x18, 0xFFFF_FFFF).unwrap();
        assert!(dev.bar(2).unwrap().probe_pending());
        assert_eq!(dev.read_dword(0x18).unwrap(), 0xFFFF_E000);
        assert!(!dev.bar(2).unwrap().probe_pending());
        assert_eq!(dev.read_dword(0x18).unwrap(), base);
    }

    #[test]
    fn narrow_reads_do_not_consume_the_probe() {
        let mut mem = window();
        let mut dev = with_bar(&mut mem, 0, "0x1000");

        dev.write_dword(0x10, 0xFFFF_FFFF).unwrap();
        assert_eq!(dev.read_word(0x12).unwrap(), 0xFFFF);
        assert_eq!(dev.read_byte(0x11).unwrap(), 0xF0);
        assert!(dev.bar(0).unwrap().probe_pending());
        assert_eq!(dev.read_dword(0x10).unwrap(), 0xFFFF_F000);
        assert_eq!(dev.read_dword(0x10).unwrap(), 0xE000_0000);
    }

    #[test]
    fn a_write_cancels_a_pending_probe() {
        let mut mem = window();
        let mut dev = with_bar(&mut mem, 1, "256");
        let base = dev.bar(1).unwrap().backing_address();

        dev.write_dword(0x14, 0xFFFF_FFFF).unwrap();
        dev.access(0x15, AccessWidth::Byte, AccessDirection::Write, 0x12)
            .unwrap();
        assert!(!dev.bar(1).unwrap().probe_pending());
        let expected = (base & 0xFFFF_00FF) | 0x1200;
        assert_eq!(dev.read_dword(0x14).unwrap(), expected);

        dev.write_dword(0x14, 0xFFFF_FFFF).unwrap();
        dev.write_dword(0x14, 0x1234_5670).unwrap();
        assert!(!dev.bar(1).unwrap().probe_pending());
        assert_eq!(dev.read_dword(0x14).unwrap(), 0x1234_5670);

        // Sizing again restores the backing address afterwards.
        dev.write_dword(0x14, 0xFFFF_FFFF).unwrap();
        assert_eq!(dev.read_dword(0x14).unwrap(), 0xFFFF_FF00);
        assert_eq!(dev.read_dword(0x14).unwrap(), base);
    }

    #[test]
    fn repeated_all_ones_writes_keep_the_probe_armed() {
        let mut mem = window();
        let mut dev = with_bar(&mut mem, 5, "0x40");
        dev.write_dword(0x24, 0xFFFF_FFFF).unwrap();
        dev.write_dword(0x24, 0xFFFF_FFFF).unwrap();
        assert!(dev.bar(5).unwrap().probe_pending());
        assert_eq!(dev.read_dword(0x24).unwrap(), 0xFFFF_FFC0);
    }

    #[test]
    fn unimplemented_bars_store_raw_writes() {
        let mut mem = window();
        let mut dev = Device::from_descriptor(PciBdf::default(), &empty(), ROM, &mut mem).unwrap();
        for (index, offset) in (0x10u16..0x28).step_by(4).enumerate() {
            assert_eq!(dev.read_dword(offset).unwrap(), 0);
            dev.write_dword(offset, 0x1234_5670).unwrap();
            assert_eq!(dev.read_dword(offset).unwrap(), 0x1234_5670);

            dev.write_dword(offset, 0xFFFF_FFFF).unwrap();
            assert!(!dev.bar(index).unwrap().probe_pending());
            assert_eq!(dev.read_dword(offset).unwrap(), 0xFFFF_FFFF);
            assert_eq!(dev.read_dword(offset).unwrap(), 0xFFFF_FFFF);

            dev.access(offset + 1, AccessWidth::Byte, AccessDirection::Write, 0xAB)
                .unwrap();
            assert_eq!(dev.read_dword(offset).unwrap(), 0xFFFF_ABFF);
        }
        assert_eq!(dev.allocated_bars(), 0);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn plain_registers_are_byte_addressed() {
        let mut mem = window();
        let mut dev = Device::from_descriptor(PciBdf::default(), &empty(), ROM, &mut mem).unwrap();
        dev.access(0x3C, AccessWidth::Dword, AccessDirection::Write, 0x0102_030B)
            .unwrap();
        assert_eq!(dev.read_byte(0x3C).unwrap(), 0x0B);
        assert_eq!(dev.read_word(0x3D).unwrap(), 0x0203);
        assert_eq!(
            dev.access(0x04, AccessWidth::Word, AccessDirection::Write, 0xABCD_0007)
                .unwrap(),
            0x0007
        );
        assert_eq!(dev.read_dword(0x04).unwrap(), 0x0000_0007);
    }

    #[test]
    fn out_of_range_accesses_fail() {
        let mut dev = Device::default();
        assert_eq!(
            dev.read_byte(0x100),
            Err(AccessError::OutOfRange {
                offset: 0x100,
                width: AccessWidth::Byte
            })
        );
        assert!(dev.read_dword(0xFD).is_err());
        assert!(dev.read_dword(0xFC).is_ok());
        assert!(dev.write_dword(0xFFFF, 0).is_err());
    }

    #[test]
    fn rom_region_must_fit_below_4gib() {
        assert!(RomRegion::try_new(0x1_0000_0000, 0x800).is_err());
        assert!(RomRegion::try_new(0xFFFF_F000, 0x1000).is_err());
        assert_eq!(RomRegion::try_new(0xC0000, 0x8000).unwrap(), ROM);

        let mut mem = window();
        let bad = RomRegion {
            address: LowAddr::new(0xFFFF_F800),
            size: 0x1000,
        };
        assert_eq!(
            Device::default().build(&DeviceDescriptor::default(), bad, &mut mem),
            Err(BuildError::RomOutOfRange {
                address: 0xFFFF_F800,
                size: 0x1000
            })
        );
    }
}
