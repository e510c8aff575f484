use serde::Serialize;

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

pub const PCI_VENDOR_ID_OFFSET: usize = 0x00;
pub const PCI_DEVICE_ID_OFFSET: usize = 0x02;
pub const PCI_COMMAND_OFFSET: usize = 0x04;
pub const PCI_STATUS_OFFSET: usize = 0x06;
/// Revision ID, Prog IF, Subclass and Class, one byte each, starting here.
pub const PCI_CLASS_CODE_OFFSET: usize = 0x08;
pub const PCI_HEADER_TYPE_OFFSET: usize = 0x0E;
pub const PCI_BAR0_OFFSET: usize = 0x10;
pub const PCI_BAR_COUNT: usize = 6;
pub const PCI_EXPANSION_ROM_OFFSET: usize = 0x30;

/// Address bits of a 32-bit memory BAR; bits 3:0 encode type/prefetchable and read as zero here.
pub const PCI_BAR_MEM_ADDR_MASK: u32 = 0xFFFF_FFF0;

pub const fn bar_offset(index: usize) -> usize {
    PCI_BAR0_OFFSET + index * 4
}

/// BAR index whose register starts exactly at `offset`.
pub(crate) fn bar_at(offset: usize) -> Option<usize> {
    let end = bar_offset(PCI_BAR_COUNT);
    ((PCI_BAR0_OFFSET..end).contains(&offset) && offset % 4 == 0)
        .then(|| (offset - PCI_BAR0_OFFSET) / 4)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct PciClassCode {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision_id: u8,
}

impl PciClassCode {
    /// The dword at 0x08: class in the top byte, revision in the bottom byte.
    pub fn to_dword(self) -> u32 {
        u32::from_le_bytes([self.revision_id, self.prog_if, self.subclass, self.class])
    }

    pub fn from_dword(dword: u32) -> Self {
        let [revision_id, prog_if, subclass, class] = dword.to_le_bytes();
        Self {
            class,
            subclass,
            prog_if,
            revision_id,
        }
    }
}
